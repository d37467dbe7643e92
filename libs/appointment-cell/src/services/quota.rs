// libs/appointment-cell/src/services/quota.rs
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::models::{AppointmentError, RejectionReason, SchedulingConfig};
use crate::store::AppointmentStore;

/// Standing quota: Pending and Confirmed appointments count regardless of
/// their date; terminal ones never do.
pub struct QuotaEnforcer {
    store: Arc<dyn AppointmentStore>,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    pub async fn count_active(&self, client_id: Uuid) -> Result<usize, AppointmentError> {
        Ok(self.store.count_active_for_client(client_id).await?)
    }

    pub async fn ensure_capacity(&self, client_id: Uuid, config: &SchedulingConfig) -> Result<(), AppointmentError> {
        let active = self.count_active(client_id).await?;

        if active >= config.max_active_per_client as usize {
            info!(
                "Client {} holds {} active appointments (max {})",
                client_id, active, config.max_active_per_client
            );
            return Err(RejectionReason::QuotaExceeded.into());
        }

        Ok(())
    }
}
