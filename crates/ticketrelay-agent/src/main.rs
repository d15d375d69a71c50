// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ticketrelay — local print agent
//
// Entry point. Initialises logging, loads settings, registers printers and
// runs the server session until SIGINT/SIGTERM.
//
//   ticketrelay                 run the agent
//   ticketrelay simulate [PORT] run a simulated thermal printer (default 9100)

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ticketrelay_core::error::RelayError;
use ticketrelay_core::human_errors::humanize_error;
use ticketrelay_core::types::RAW_PORT;
use ticketrelay_core::{JsonFileSettings, SettingsProvider};
use ticketrelay_print::usb::default_backend;
use ticketrelay_print::{PrinterDiscovery, PrinterRegistry, SimulatedPrinter, TransportTimeouts};
use ticketrelay_session::{
    Dispatcher, Endpoint, SessionConfig, SessionEngine, TracingNotifier, WsConnector,
};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let outcome = match args.next().as_deref() {
        None => run_agent().await,
        Some("simulate") => run_simulator(args.next()).await,
        Some(other) => {
            eprintln!("unknown command '{other}' (expected no arguments or 'simulate [PORT]')");
            return ExitCode::from(2);
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let human = humanize_error(&e);
            error!(error = %e, "Ticketrelay stopped");
            eprintln!("{}\n{}", human.message, human.suggestion);
            ExitCode::FAILURE
        }
    }
}

async fn run_agent() -> Result<(), RelayError> {
    info!(version = env!("CARGO_PKG_VERSION"), "Ticketrelay agent starting");

    // tungstenite's rustls connector needs a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let store = Arc::new(JsonFileSettings::discover());
    info!(path = %store.path().display(), "loading settings");
    let settings = store.get_settings()?;
    settings.validate()?;

    let usb = default_backend();
    let registry = Arc::new(PrinterRegistry::new(Arc::clone(&usb), TransportTimeouts::default()));
    let registered = registry.initialize(&settings.printers).await;
    info!(registered, "printers registered");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        store,
        Arc::new(TracingNotifier),
        Arc::new(PrinterDiscovery::new(usb)),
    ));
    let connector = Arc::new(WsConnector::new(Endpoint::from(&settings)));
    let shutdown = CancellationToken::new();
    let engine = SessionEngine::new(
        connector,
        dispatcher,
        SessionConfig::from(&settings),
        shutdown.clone(),
    );
    let mut session = tokio::spawn(engine.run());

    tokio::select! {
        _ = shutdown_signal() => {
            shutdown.cancel();
            if let Err(e) = session.await {
                warn!(error = %e, "session task ended abnormally");
            }
        }
        finished = &mut session => {
            match finished {
                Ok(state) => warn!(?state, "server session ended; waiting for shutdown"),
                Err(e) => warn!(error = %e, "session task ended abnormally"),
            }
            shutdown_signal().await;
            registry.clear().await;
        }
    }

    info!("Ticketrelay agent stopped");
    Ok(())
}

async fn run_simulator(port: Option<String>) -> Result<(), RelayError> {
    let port = match port {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| RelayError::Settings(format!("invalid port '{raw}'")))?,
        None => RAW_PORT,
    };
    let mut printer = SimulatedPrinter::bind(&format!("0.0.0.0:{port}")).await?;
    info!(addr = %printer.addr(), "simulated thermal printer listening");

    loop {
        tokio::select! {
            _ = shutdown_signal() => break,
            ticket = printer.next_ticket() => match ticket {
                Some(ticket) => {
                    info!(peer = %ticket.peer, bytes = ticket.bytes.len(), "ticket received");
                    println!("{}", ticket.trace);
                }
                None => break,
            },
        }
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
