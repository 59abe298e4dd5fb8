//! Logs every control event as one JSON line.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetgrid_state::ControlEvent;

pub async fn run(mut events: broadcast::Receiver<ControlEvent>, mut shutdown: watch::Receiver<bool>) {
    debug!("event monitor started");
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event monitor lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("event monitor stopped");
}

fn log_event(event: &ControlEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(target: "fleetd::events", event = %json, "control event"),
        Err(e) => warn!(error = %e, "failed to encode control event"),
    }
}
