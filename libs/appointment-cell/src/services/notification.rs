// libs/appointment-cell/src/services/notification.rs
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::models::StateChangeNotification;

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Delivers a committed state change to the client.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &StateChangeNotification) -> Result<(), NotificationError>;
}

/// Writes notifications to the log instead of delivering them.
pub struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send(&self, notification: &StateChangeNotification) -> Result<(), NotificationError> {
        info!(
            appointment_id = %notification.appointment_id,
            state = %notification.new_state,
            "Notify {} <{}>: appointment with {} on {} is now {}",
            notification.client_name,
            notification.client_email.as_deref().unwrap_or("no email"),
            notification.barber_name,
            notification.slot_start,
            notification.new_state
        );
        Ok(())
    }
}

/// Producer side of the post-commit notification queue.
#[derive(Clone)]
pub struct NotificationOutbox {
    tx: mpsc::UnboundedSender<StateChangeNotification>,
}

impl NotificationOutbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StateChangeNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never blocks and never fails the caller; a closed queue is only logged.
    pub fn publish(&self, notification: StateChangeNotification) {
        let id = notification.appointment_id;
        if self.tx.send(notification).is_err() {
            warn!("Notification dispatcher is gone, dropping notification for appointment {}", id);
        } else {
            debug!("Queued notification for appointment {}", id);
        }
    }
}

pub struct NotificationDispatcher {
    rx: mpsc::UnboundedReceiver<StateChangeNotification>,
    sender: Arc<dyn NotificationSender>,
    max_attempts: u32,
    backoff: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        rx: mpsc::UnboundedReceiver<StateChangeNotification>,
        sender: Arc<dyn NotificationSender>,
        max_attempts: u32,
    ) -> Self {
        Self {
            rx,
            sender,
            max_attempts: max_attempts.max(1),
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drains the queue until every outbox handle is dropped.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!("Notification dispatcher started");

        while let Some(notification) = self.rx.recv().await {
            self.deliver(&notification).await;
        }

        info!("Notification dispatcher stopped");
    }

    /// Returns whether the notification was delivered.
    pub async fn deliver(&self, notification: &StateChangeNotification) -> bool {
        for attempt in 1..=self.max_attempts {
            match self.sender.send(notification).await {
                Ok(()) => return true,
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        "Notification for {} failed (attempt {}/{}): {}",
                        notification.appointment_id, attempt, self.max_attempts, e
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => {
                    error!(
                        "Giving up on notification for {} after {} attempts: {}",
                        notification.appointment_id, attempt, e
                    );
                }
            }
        }
        false
    }
}
