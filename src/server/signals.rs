//! Signal-to-event translation.
//!
//! Signal handlers do nothing but push a typed event onto the control
//! channel; the lifecycle controller's event loop is the only place that
//! acts on them. SIGHUP reloads, SIGTERM terminates gracefully, SIGINT
//! terminates immediately.

use super::ControlEvent;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};

#[cfg(unix)]
pub fn spawn(tx: UnboundedSender<ControlEvent>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e, "cannot register SIGHUP handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e, "cannot register SIGTERM handler");
                return;
            }
        };
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e, "cannot register SIGINT handler");
                return;
            }
        };

        loop {
            let event = tokio::select! {
                _ = hangup.recv() => {
                    info!("SIGHUP received — scheduling reload");
                    ControlEvent::Reload
                }
                _ = terminate.recv() => {
                    info!("SIGTERM received — scheduling graceful shutdown");
                    ControlEvent::Graceful
                }
                _ = interrupt.recv() => {
                    info!("SIGINT received — scheduling immediate shutdown");
                    ControlEvent::Immediate
                }
            };
            if tx.send(event).is_err() {
                return;
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn(tx: UnboundedSender<ControlEvent>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received — scheduling graceful shutdown");
            let _ = tx.send(ControlEvent::Graceful);
        }
    });
}
