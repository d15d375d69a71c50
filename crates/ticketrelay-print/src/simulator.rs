// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Simulated network thermal printer.
//
// Listens like a port-9100 printer, reads each connection to end-of-stream,
// decodes what it received and closes. Handy for local development and for
// exercising the raw transport without hardware.

use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ticketrelay_core::error::Result;

use crate::trace::decode_trace;

/// One ticket as received by the simulator.
#[derive(Debug, Clone)]
pub struct CapturedTicket {
    pub peer: SocketAddr,
    pub bytes: Vec<u8>,
    pub trace: String,
}

pub struct SimulatedPrinter {
    addr: SocketAddr,
    tickets: mpsc::UnboundedReceiver<CapturedTicket>,
    task: JoinHandle<()>,
}

impl SimulatedPrinter {
    /// Listen on an ephemeral localhost port.
    pub async fn start() -> Result<Self> {
        Self::bind("127.0.0.1:0").await
    }

    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (tx, tickets) = mpsc::unbounded_channel();
        info!(addr = %addr, "simulated printer listening");
        let task = tokio::spawn(accept_loop(listener, tx));
        Ok(Self {
            addr,
            tickets,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Wait for the next complete ticket.
    pub async fn next_ticket(&mut self) -> Option<CapturedTicket> {
        self.tickets.recv().await
    }
}

impl Drop for SimulatedPrinter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<CapturedTicket>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(receive(stream, peer, tx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "simulated printer accept failed");
            }
        }
    }
}

async fn receive(mut stream: TcpStream, peer: SocketAddr, tx: mpsc::UnboundedSender<CapturedTicket>) {
    let mut bytes = Vec::new();
    if let Err(e) = stream.read_to_end(&mut bytes).await {
        warn!(peer = %peer, error = %e, "simulated printer read failed");
        return;
    }
    // Closing our side is what tells the sender the job was taken.
    drop(stream);

    if bytes.is_empty() {
        // Reachability probes connect and hang up without sending anything.
        debug!(peer = %peer, "simulated printer saw an empty connection");
        return;
    }

    let trace = decode_trace(&bytes);
    debug!(peer = %peer, bytes = bytes.len(), "simulated printer received ticket");
    let _ = tx.send(CapturedTicket { peer, bytes, trace });
}
