// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Reconnect schedule for the server session.
//
// Backoff is linear: the n-th consecutive reconnect waits `base * n`.
// Once `max_attempts` reconnects have failed in a row the session gives up.

use std::time::Duration;

use tracing::{debug, warn};

use ticketrelay_core::AgentSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for ReconnectPolicy {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            base_delay: settings.reconnect_delay(),
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// What to do after the link failed or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Make reconnect number `attempt` after `delay`.
    RetryAfter { attempt: u32, delay: Duration },
    /// The limit was reached; schedule nothing further.
    Exhausted,
}

impl ReconnectPolicy {
    /// Decide the next step given how many reconnects have already been made
    /// since the last successful open.
    pub fn next(&self, attempts_so_far: u32) -> ReconnectDecision {
        if attempts_so_far >= self.max_attempts {
            warn!(attempts = attempts_so_far, max = self.max_attempts, "reconnect limit reached");
            return ReconnectDecision::Exhausted;
        }
        let attempt = attempts_so_far + 1;
        let delay = self.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        ReconnectDecision::RetryAfter { attempt, delay }
    }

    /// delay = base * attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}
