// libs/appointment-cell/src/services/sweeper.rs
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use crate::services::booking::AppointmentBookingService;

/// Periodically closes appointments whose start time has passed.
pub struct ExpirySweeper {
    booking: Arc<AppointmentBookingService>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

/// Handle used to stop a running sweeper.
pub struct SweeperShutdown {
    tx: watch::Sender<bool>,
}

impl SweeperShutdown {
    pub fn trigger(&self) {
        // No receivers only means the sweeper already stopped.
        let _ = self.tx.send(true);
    }
}

impl ExpirySweeper {
    pub fn new(booking: Arc<AppointmentBookingService>, period: Duration) -> (Self, SweeperShutdown) {
        let (tx, rx) = watch::channel(false);
        (
            Self { booking, period, shutdown: rx },
            SweeperShutdown { tx },
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), fields(period_secs = self.period.as_secs()))]
    pub async fn run(mut self) {
        info!("Expiry sweeper started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once().await,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("Expiry sweeper received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!("Expiry sweeper stopped");
    }

    async fn sweep_once(&self) {
        let now = self.booking.now();
        match self.booking.sweep_expired(now).await {
            Ok(report) => debug!(
                "Scheduled sweep: {} expired, {} attended, {} failed",
                report.expired_count, report.attended_count, report.failed_count
            ),
            // Keep running; the next tick retries.
            Err(e) => error!("Scheduled sweep failed: {}", e),
        }
    }
}
