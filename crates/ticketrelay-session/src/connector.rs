// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Opening the bidirectional text channel to the server.
//
// The engine only sees a sink of outgoing text frames and a stream of
// incoming ones. `WsConnector` provides them over a websocket; tests plug
// in in-memory channels.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, instrument};

use ticketrelay_core::AgentSettings;
use ticketrelay_core::error::{RelayError, Result};

/// Path of the agent endpoint below the server's `/api` root.
pub const AGENT_WS_PATH: &str = "/print-agent-ws";

pub type OutboundSink = Pin<Box<dyn Sink<String, Error = RelayError> + Send>>;
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One open link. The stream ends or yields an error when the link drops.
pub struct Connection {
    pub sink: OutboundSink,
    pub stream: InboundStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection>;
}

/// Server address and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub server_url: String,
    pub restaurant_id: String,
    pub api_key: String,
}

impl From<&AgentSettings> for Endpoint {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            server_url: settings.server_url.clone(),
            restaurant_id: settings.restaurant_id.clone(),
            api_key: settings.api_key.clone(),
        }
    }
}

impl Endpoint {
    /// `wss://host/api/print-agent-ws?restaurantId=…&apiKey=…`
    ///
    /// `https`/`http` become `wss`/`ws`, and `/api` is appended unless the
    /// base already ends with it.
    pub fn url(&self) -> String {
        let base = self
            .server_url
            .trim()
            .trim_end_matches('/')
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let api_root = if base.ends_with("/api") {
            base
        } else {
            format!("{base}/api")
        };
        format!(
            "{api_root}{AGENT_WS_PATH}?restaurantId={}&apiKey={}",
            percent_encode(&self.restaurant_id),
            percent_encode(&self.api_key)
        )
    }

    /// URL with the api key masked, for logs.
    pub fn redacted_url(&self) -> String {
        Endpoint {
            api_key: "***".into(),
            ..self.clone()
        }
        .url()
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

pub struct WsConnector {
    endpoint: Endpoint,
}

impl WsConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Connector for WsConnector {
    #[instrument(skip(self), fields(url = %self.endpoint.redacted_url()))]
    async fn connect(&self) -> Result<Connection> {
        let mut request = self
            .endpoint
            .url()
            .into_client_request()
            .map_err(|e| RelayError::Connection(format!("invalid server url: {e}")))?;

        let headers = request.headers_mut();
        headers.insert("X-Restaurant-Id", header_value(&self.endpoint.restaurant_id)?);
        headers.insert("X-Api-Key", header_value(&self.endpoint.api_key)?);

        let (ws_stream, _response) = connect_async(request).await.map_err(|e| {
            // Credentials problems show up as an HTTP status on the upgrade.
            if let tungstenite::Error::Http(ref resp) = e {
                let status = resp.status().as_u16();
                if status == 401 || status == 403 {
                    return RelayError::Connection(format!(
                        "server rejected the agent credentials (HTTP {status})"
                    ));
                }
            }
            RelayError::Connection(format!("websocket connect failed: {e}"))
        })?;
        info!("websocket connected");

        let (sink, stream) = ws_stream.split();
        let sink = sink
            .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::text(text))))
            .sink_map_err(|e| RelayError::Connection(e.to_string()));
        let stream = stream.filter_map(|frame| future::ready(text_frame(frame)));

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| RelayError::Settings("credentials contain characters not allowed in a header".into()))
}

/// Reduce a websocket frame to text. Control frames are handled by
/// tungstenite itself; a close frame ends the session.
fn text_frame(frame: std::result::Result<Message, tungstenite::Error>) -> Option<Result<String>> {
    match frame {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Ok(text)),
            Err(_) => {
                debug!(len = bytes.len(), "ignoring non-UTF-8 binary frame");
                None
            }
        },
        Ok(Message::Close(frame)) => {
            let reason = frame
                .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                .unwrap_or_else(|| "no reason".into());
            Some(Err(RelayError::Connection(format!("server closed the session ({reason})"))))
        }
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(RelayError::Connection(e.to_string()))),
    }
}
