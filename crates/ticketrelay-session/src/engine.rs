// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The server session: connect, announce, dispatch, heartbeat, reconnect.
//
// Only one link exists at a time. The heartbeat timer lives inside the
// per-link loop, so it cannot outlive the link it belongs to. Replies
// produced while the link is down wait in the reply queue and go out on
// the next link; heartbeats are never queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ticketrelay_core::AgentSettings;
use ticketrelay_core::error::{RelayError, Result};
use ticketrelay_core::human_errors::humanize_error;

use crate::connector::{Connection, Connector, OutboundSink};
use crate::dispatch::Dispatcher;
use crate::protocol::{Outbound, parse_inbound};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for SessionConfig {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            reconnect: ReconnectPolicy::from(settings),
            heartbeat_interval: settings.heartbeat_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Open,
    /// Link failed or closed; a reconnect is scheduled.
    Faulted,
    /// Reconnects exhausted; nothing further is scheduled.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Consecutive reconnects since the last successful open.
    pub reconnect_attempts: u32,
}

enum LinkEnd {
    Shutdown,
    Lost(RelayError),
}

pub struct SessionEngine {
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    config: SessionConfig,
    shutdown: CancellationToken,
    state: watch::Sender<SessionState>,
    replies_tx: mpsc::UnboundedSender<Outbound>,
    replies_rx: mpsc::UnboundedReceiver<Outbound>,
    /// Replies taken off the queue that the last link failed to deliver.
    unsent: VecDeque<Outbound>,
}

impl SessionEngine {
    pub fn new(
        connector: Arc<dyn Connector>,
        dispatcher: Arc<Dispatcher>,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SessionState {
            phase: SessionPhase::Disconnected,
            reconnect_attempts: 0,
        });
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            dispatcher,
            config,
            shutdown,
            state,
            replies_tx,
            replies_rx,
            unsent: VecDeque::new(),
        }
    }

    /// Watch phase and attempt-count changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drive the session until shutdown or until reconnects are exhausted.
    /// Returns the final state.
    pub async fn run(mut self) -> SessionState {
        info!(
            heartbeat_ms = self.config.heartbeat_interval.as_millis() as u64,
            max_reconnects = self.config.reconnect.max_attempts,
            "session engine started"
        );
        let mut attempts = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(SessionPhase::Connecting, attempts);

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                connected = self.connector.connect() => connected,
            };

            let reason = match connected {
                Ok(connection) => {
                    attempts = 0;
                    self.set_state(SessionPhase::Open, 0);
                    info!("server session open");
                    self.dispatcher.announce_connected();
                    match self.run_link(connection).await {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Lost(reason) => reason,
                    }
                }
                Err(e) => e,
            };
            warn!(error = %reason, attempts, "server link down");

            match self.config.reconnect.next(attempts) {
                ReconnectDecision::RetryAfter { attempt, delay } => {
                    attempts = attempt;
                    self.set_state(SessionPhase::Faulted, attempts);
                    info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ReconnectDecision::Exhausted => {
                    self.set_state(SessionPhase::Terminated, attempts);
                    let err = RelayError::ReconnectExhausted(attempts);
                    error!(error = %err, "giving up on the server");
                    self.dispatcher
                        .notifier()
                        .notify_error("Print agent offline", &humanize_error(&err));
                    return *self.state.borrow();
                }
            }
        }

        self.dispatcher.registry().clear().await;
        self.set_state(SessionPhase::Disconnected, 0);
        info!("session engine stopped");
        *self.state.borrow()
    }

    /// One open link: status first, then leftovers, then the event loop.
    async fn run_link(&mut self, connection: Connection) -> LinkEnd {
        let Connection {
            mut sink,
            mut stream,
        } = connection;

        let status = Outbound::AgentStatus(self.dispatcher.agent_status().await);
        if let Err(e) = send(&mut sink, &status).await {
            return LinkEnd::Lost(e);
        }
        while let Some(reply) = self.unsent.pop_front() {
            if let Err(e) = send(&mut sink, &reply).await {
                self.unsent.push_front(reply);
                return LinkEnd::Lost(e);
            }
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("closing server session");
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    return LinkEnd::Shutdown;
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = send(&mut sink, &Outbound::heartbeat()).await {
                        return LinkEnd::Lost(e);
                    }
                }

                Some(reply) = self.replies_rx.recv() => {
                    if let Err(e) = send(&mut sink, &reply).await {
                        self.unsent.push_back(reply);
                        return LinkEnd::Lost(e);
                    }
                }

                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.on_text(&text),
                    Some(Err(e)) => return LinkEnd::Lost(e),
                    None => {
                        return LinkEnd::Lost(RelayError::Connection("server ended the session".into()));
                    }
                },
            }
        }
    }

    /// Parse and hand off one inbound frame. Handlers run on their own
    /// tasks; replies come back through the reply queue.
    fn on_text(&self, text: &str) {
        let inbound = match parse_inbound(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "dropping invalid message");
                return;
            }
        };
        debug!(kind = inbound.kind(), "message received");

        let dispatcher = Arc::clone(&self.dispatcher);
        let replies = self.replies_tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = dispatcher.handle(inbound).await {
                let _ = replies.send(reply);
            }
        });
    }

    fn set_state(&self, phase: SessionPhase, reconnect_attempts: u32) {
        self.state.send_replace(SessionState {
            phase,
            reconnect_attempts,
        });
    }
}

async fn send(sink: &mut OutboundSink, message: &Outbound) -> Result<()> {
    let text = message.to_text()?;
    sink.send(text).await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use futures_util::stream;
    use serde_json::Value;
    use tokio::task::JoinHandle;
    use tokio_util::sync::PollSender;

    use super::*;
    use crate::dispatch::testing::{Harness, closed_port, harness, raw_printer};

    /// The server's end of an in-memory link.
    struct ServerEnd {
        to_agent: mpsc::UnboundedSender<Result<String>>,
        from_agent: mpsc::Receiver<String>,
    }

    impl ServerEnd {
        fn send(&self, text: &str) {
            self.to_agent.send(Ok(text.to_string())).expect("agent listening");
        }

        async fn recv(&mut self) -> Option<Value> {
            let text = tokio::time::timeout(Duration::from_secs(5), self.from_agent.recv())
                .await
                .expect("agent replied in time")?;
            Some(serde_json::from_str(&text).expect("agent sent JSON"))
        }

        /// Next message of `kind`, skipping anything else.
        async fn recv_kind(&mut self, kind: &str) -> Value {
            loop {
                let message = self.recv().await.expect("link open");
                if message["type"] == kind {
                    return message;
                }
            }
        }
    }

    fn link() -> (Connection, ServerEnd) {
        let (to_agent, agent_rx) = mpsc::unbounded_channel::<Result<String>>();
        let (agent_tx, from_agent) = mpsc::channel::<String>(64);
        let sink = PollSender::new(agent_tx)
            .sink_map_err(|_| RelayError::Connection("server end dropped".into()));
        let stream = stream::unfold(agent_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let connection = Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        };
        (connection, ServerEnd { to_agent, from_agent })
    }

    /// Hands out prepared links in order, then refuses.
    #[derive(Default)]
    struct ScriptedConnector {
        links: Mutex<VecDeque<Connection>>,
        calls: AtomicU32,
    }

    impl ScriptedConnector {
        fn with_links(count: usize) -> (Arc<Self>, Vec<ServerEnd>) {
            let connector = Self::default();
            let mut ends = Vec::new();
            for _ in 0..count {
                let (connection, end) = link();
                connector.links.lock().expect("lock").push_back(connection);
                ends.push(end);
            }
            (Arc::new(connector), ends)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Connection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.links
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or_else(|| RelayError::Connection("connection refused".into()))
        }
    }

    fn quick(max_attempts: u32) -> SessionConfig {
        SessionConfig {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(1),
                max_attempts,
            },
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    struct Running {
        shutdown: CancellationToken,
        state: watch::Receiver<SessionState>,
        task: JoinHandle<SessionState>,
    }

    fn start(h: &Harness, connector: Arc<dyn Connector>, config: SessionConfig) -> Running {
        let shutdown = CancellationToken::new();
        let engine = SessionEngine::new(connector, Arc::clone(&h.dispatcher), config, shutdown.clone());
        let state = engine.subscribe();
        let task = tokio::spawn(engine.run());
        Running {
            shutdown,
            state,
            task,
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let h = harness();
        let (connector, _) = ScriptedConnector::with_links(0);
        let running = start(&h, connector.clone(), quick(3));

        let final_state = tokio::time::timeout(Duration::from_secs(5), running.task)
            .await
            .expect("engine stopped")
            .expect("engine task");
        assert_eq!(final_state.phase, SessionPhase::Terminated);
        assert_eq!(final_state.reconnect_attempts, 3);
        // The initial attempt plus three reconnects, then nothing further.
        assert_eq!(connector.calls.load(Ordering::SeqCst), 4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 4);
        assert!(h.notifier.titles().contains(&"Print agent offline".to_string()));
    }

    #[tokio::test]
    async fn status_is_sent_first_and_unknown_printer_reported() {
        let h = harness();
        let (connector, mut ends) = ScriptedConnector::with_links(1);
        let running = start(&h, connector, quick(0));
        let server = &mut ends[0];

        let status = server.recv().await.expect("status");
        assert_eq!(status["type"], "AGENT_STATUS");
        assert_eq!(status["payload"]["version"], env!("CARGO_PKG_VERSION"));

        server.send(
            r#"{"type":"PRINT_JOB","payload":{"jobId":"j1","printerName":"Patio","contentType":"text","content":"aGk="}}"#,
        );
        let result = server.recv_kind("PRINT_RESULT").await;
        assert_eq!(result["payload"]["jobId"], "j1");
        assert_eq!(result["payload"]["status"], "ERROR");
        assert_eq!(result["payload"]["error"], "printer not found: Patio");

        running.shutdown.cancel();
        let final_state = running.task.await.expect("engine task");
        assert_eq!(final_state.phase, SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn unreachable_printer_yields_one_error_result() {
        let h = harness();
        let port = closed_port().await;
        h.dispatcher.registry().initialize(&[raw_printer("Bar", port)]).await;

        let (connector, mut ends) = ScriptedConnector::with_links(1);
        let running = start(&h, connector, quick(0));
        let server = &mut ends[0];
        server.recv_kind("AGENT_STATUS").await;

        server.send(
            r#"{"type":"PRINT_JOB","payload":{"jobId":"j7","printerName":"Bar","contentType":"text","content":"aGk="}}"#,
        );
        let result = server.recv_kind("PRINT_RESULT").await;
        assert_eq!(result["payload"]["jobId"], "j7");
        assert_eq!(result["payload"]["status"], "ERROR");
        assert!(
            result["payload"]["error"]
                .as_str()
                .expect("error text")
                .starts_with("network error")
        );

        running.shutdown.cancel();
        running.task.await.expect("engine task");
    }

    #[tokio::test]
    async fn numeric_job_id_comes_back_unchanged() {
        let h = harness();
        let (connector, mut ends) = ScriptedConnector::with_links(1);
        let running = start(&h, connector, quick(0));
        let server = &mut ends[0];
        server.recv_kind("AGENT_STATUS").await;

        server.send(r#"{"type":"PRINT_JOB","payload":{"jobId":42,"printerName":"Patio","contentType":"escpos","content":"SGVsbG8="}}"#);
        let result = server.recv_kind("PRINT_RESULT").await;
        assert_eq!(result["payload"]["jobId"], 42);
        assert_eq!(result["payload"]["error"], "printer not found: Patio");

        server.send(r#"{"type":"PRINT_JOB","payload":{"jobId":43,"content":{"lines":[]}}}"#);
        let result = server.recv_kind("PRINT_RESULT").await;
        assert_eq!(result["payload"]["jobId"], 43);
        assert_eq!(result["payload"]["status"], "ERROR");

        running.shutdown.cancel();
        running.task.await.expect("engine task");
    }

    #[tokio::test]
    async fn garbage_and_unknown_types_are_ignored() {
        let h = harness();
        let (connector, mut ends) = ScriptedConnector::with_links(1);
        let running = start(&h, connector, quick(0));
        let server = &mut ends[0];
        server.recv_kind("AGENT_STATUS").await;

        server.send("this is not json");
        server.send(r#"{"type":"REBOOT","payload":{}}"#);
        server.send(r#"{"type":"PING"}"#);

        let pong = server.recv().await.expect("pong");
        assert_eq!(pong["type"], "PONG");
        assert!(pong["payload"]["timestamp"].is_i64());
        assert_eq!(running.state.borrow().phase, SessionPhase::Open);

        running.shutdown.cancel();
        running.task.await.expect("engine task");
    }

    #[tokio::test]
    async fn config_update_reports_new_printers() {
        let h = harness();
        let (connector, mut ends) = ScriptedConnector::with_links(1);
        let running = start(&h, connector, quick(0));
        let server = &mut ends[0];
        let first = server.recv_kind("AGENT_STATUS").await;
        assert_eq!(first["payload"]["printers"], Value::Array(Vec::new()));

        let port = closed_port().await;
        server.send(&format!(
            r#"{{"type":"CONFIG_UPDATE","payload":{{"printers":[{{"name":"Grill","type":"network","ip":"127.0.0.1","port":{port}}}]}}}}"#
        ));
        let status = server.recv_kind("AGENT_STATUS").await;
        let printers = status["payload"]["printers"].as_array().expect("printers");
        assert_eq!(printers.len(), 1);
        assert_eq!(printers[0]["name"], "Grill");
        assert_eq!(printers[0]["connected"], false);

        running.shutdown.cancel();
        running.task.await.expect("engine task");
        assert!(h.dispatcher.registry().is_empty().await);
    }

    #[tokio::test]
    async fn heartbeats_flow_while_open() {
        let h = harness();
        let (connector, mut ends) = ScriptedConnector::with_links(1);
        let config = SessionConfig {
            heartbeat_interval: Duration::from_millis(20),
            ..quick(0)
        };
        let running = start(&h, connector, config);
        let server = &mut ends[0];
        server.recv_kind("AGENT_STATUS").await;

        let beat = server.recv_kind("HEARTBEAT").await;
        assert!(beat["payload"]["timestamp"].is_i64());

        running.shutdown.cancel();
        running.task.await.expect("engine task");
    }

    #[tokio::test]
    async fn reconnects_after_server_closes_and_resets_attempts() {
        let h = harness();
        let (connector, mut ends) = ScriptedConnector::with_links(2);
        let mut running = start(&h, connector.clone(), quick(5));

        let mut second = ends.pop().expect("second link");
        let mut first = ends.pop().expect("first link");
        first.recv_kind("AGENT_STATUS").await;
        drop(first);

        second.recv_kind("AGENT_STATUS").await;
        let state = *running
            .state
            .wait_for(|s| s.phase == SessionPhase::Open)
            .await
            .expect("state");
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);

        running.shutdown.cancel();
        running.task.await.expect("engine task");
    }

    #[tokio::test]
    async fn shutdown_closes_the_link() {
        let h = harness();
        let (connector, mut ends) = ScriptedConnector::with_links(1);
        let running = start(&h, connector, quick(3));
        let server = &mut ends[0];
        server.recv_kind("AGENT_STATUS").await;

        running.shutdown.cancel();
        let final_state = running.task.await.expect("engine task");
        assert_eq!(
            final_state,
            SessionState {
                phase: SessionPhase::Disconnected,
                reconnect_attempts: 0
            }
        );
        assert!(server.recv().await.is_none(), "agent side of the link is closed");
    }
}
