//! Logs every low-stock alert published on the bus.

use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use tracing::{info, warn};

use supplyline_events::{Event, EventBus, Subscription};
use supplyline_stock::LowStockAlert;

use super::{WorkerHandle, shutdown_channel};

const TICK: Duration = Duration::from_millis(250);

/// Drains a bus subscription on a blocking thread and writes each alert to
/// the log at `warn`.
#[derive(Debug)]
pub struct AlertLogger;

impl AlertLogger {
    /// Subscribe now and drain on a blocking tokio thread. Alerts published
    /// before this call are not seen.
    pub fn spawn<B>(bus: &B) -> WorkerHandle
    where
        B: EventBus<LowStockAlert> + ?Sized,
    {
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let sub: Subscription<LowStockAlert> = bus.subscribe();

        let join = tokio::task::spawn_blocking(move || {
            info!(worker = "alert-logger", "alert logger started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match sub.recv_timeout(TICK) {
                    Ok(alert) => log_alert(&alert),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!(worker = "alert-logger", "alert bus dropped");
                        break;
                    }
                }
            }
            info!(worker = "alert-logger", "alert logger stopped");
        });

        WorkerHandle::new("alert-logger", shutdown_tx, join)
    }
}

fn log_alert(alert: &LowStockAlert) {
    warn!(
        event = alert.event_type(),
        material_id = %alert.material_id,
        unit_id = %alert.unit_id,
        location = %alert.location,
        quantity = alert.quantity,
        alert_threshold = alert.alert_threshold,
        "stock below alert threshold"
    );
}
