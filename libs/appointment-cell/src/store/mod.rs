// libs/appointment-cell/src/store/mod.rs
pub mod memory;
pub mod supabase;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use thiserror::Error;
use uuid::Uuid;

use shared_models::auth::Role;

use crate::models::{
    Appointment, AppointmentError, AppointmentState, BarberAvailability, DirectoryUser,
    RejectionReason, ScheduleBlock,
};

#[derive(Error, Debug)]
pub enum StoreError {
    /// The write would make two active appointments of a barber overlap.
    #[error("Slot already taken for barber {barber_id} at {start_time}")]
    Conflict { barber_id: Uuid, start_time: NaiveDateTime },

    /// The client already holds the maximum number of active appointments.
    #[error("Client {client_id} already holds {max} active appointments")]
    QuotaExceeded { client_id: Uuid, max: u32 },

    /// A conditional update found a different state than expected.
    #[error("Appointment {id} is no longer {expected}")]
    StaleState { id: Uuid, expected: AppointmentState },

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for AppointmentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => AppointmentError::ConcurrentBooking,
            StoreError::QuotaExceeded { .. } => AppointmentError::Rejected(RejectionReason::QuotaExceeded),
            StoreError::StaleState { .. } => AppointmentError::ConcurrentModification,
            StoreError::NotFound(id) => AppointmentError::NotFound(id),
            StoreError::Backend(msg) => AppointmentError::Storage(msg),
        }
    }
}

/// Persistence of appointments. Implementations must enforce the
/// no-overlap rule for active appointments at write time.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError>;

    /// Insert a new appointment occupying `[start_time, start_time + slot)`.
    /// The overlap rule and the client's standing quota are both enforced
    /// as part of the write.
    async fn insert(
        &self,
        appointment: &Appointment,
        slot: Duration,
        max_active_per_client: u32,
    ) -> Result<Appointment, StoreError>;

    /// Replace a stored appointment only if its current state is `expected_state`.
    async fn update(
        &self,
        appointment: &Appointment,
        expected_state: AppointmentState,
        slot: Duration,
    ) -> Result<Appointment, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Appointments of a barber starting within `[from, to)`, ordered by start.
    async fn list_for_barber(
        &self,
        barber_id: Uuid,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Appointment>, StoreError>;

    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<Appointment>, StoreError>;

    /// Every appointment of a barber, ordered by start.
    async fn list_all_for_barber(&self, barber_id: Uuid) -> Result<Vec<Appointment>, StoreError>;

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError>;

    /// Active appointments whose start is strictly before `now`.
    async fn list_stale(&self, now: NaiveDateTime) -> Result<Vec<Appointment>, StoreError>;

    async fn count_active_for_client(&self, client_id: Uuid) -> Result<usize, StoreError>;
}

/// Raw key-value scheduling settings.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_values(&self, keys: &[&str]) -> Result<HashMap<String, String>, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<DirectoryUser>, StoreError>;

    async fn exists_with_role(&self, id: Uuid, role: Role) -> Result<bool, StoreError> {
        Ok(self
            .get_by_id(id)
            .await?
            .map(|user| user.active && user.role == role)
            .unwrap_or(false))
    }
}

#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    async fn windows_for_barber(&self, barber_id: Uuid) -> Result<Vec<BarberAvailability>, StoreError>;

    async fn blocks_for_barber(
        &self,
        barber_id: Uuid,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<ScheduleBlock>, StoreError>;
}

/// The collaborators the scheduling services read and write through.
#[derive(Clone)]
pub struct SchedulingStores {
    pub appointments: Arc<dyn AppointmentStore>,
    pub config: Arc<dyn ConfigStore>,
    pub users: Arc<dyn UserDirectory>,
    pub availability: Arc<dyn AvailabilityStore>,
}

impl SchedulingStores {
    /// Use one backend for every concern.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: AppointmentStore + ConfigStore + UserDirectory + AvailabilityStore + 'static,
    {
        Self {
            appointments: backend.clone(),
            config: backend.clone(),
            users: backend.clone(),
            availability: backend,
        }
    }
}

/// Half-open overlap of `[a_start, a_end)` and `[b_start, b_end)`.
pub fn ranges_overlap(
    a_start: NaiveDateTime,
    a_end: NaiveDateTime,
    b_start: NaiveDateTime,
    b_end: NaiveDateTime,
) -> bool {
    a_start < b_end && a_end > b_start
}
