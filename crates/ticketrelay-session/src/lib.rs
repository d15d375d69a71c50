// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ticketrelay Session — the long-lived link to the job-issuing server:
// wire envelopes, connection, reconnect schedule, heartbeat and the
// handlers that turn server requests into printer work.

pub mod connector;
pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod protocol;
pub mod reconnect;

pub use connector::{Connection, Connector, Endpoint, WsConnector};
pub use dispatch::{Dispatcher, FindPrinters};
pub use engine::{SessionConfig, SessionEngine, SessionPhase, SessionState};
pub use notify::{Notifier, NotifyLevel, TracingNotifier};
pub use reconnect::ReconnectPolicy;
