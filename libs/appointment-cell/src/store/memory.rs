// libs/appointment-cell/src/store/memory.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    Appointment, AppointmentState, BarberAvailability, DirectoryUser, ScheduleBlock,
};
use crate::store::{
    ranges_overlap, AppointmentStore, AvailabilityStore, ConfigStore, StoreError, UserDirectory,
};

#[derive(Default)]
struct Inner {
    appointments: HashMap<Uuid, Appointment>,
    users: HashMap<Uuid, DirectoryUser>,
    settings: HashMap<String, String>,
    windows: Vec<BarberAvailability>,
    blocks: Vec<ScheduleBlock>,
}

/// Process-local backend. All writes run under one write lock, so the
/// overlap re-check and the write are a single critical section.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user: DirectoryUser) {
        self.inner.write().await.users.insert(user.id, user);
    }

    pub async fn set_setting(&self, key: &str, value: &str) {
        self.inner
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
    }

    pub async fn add_window(&self, window: BarberAvailability) {
        self.inner.write().await.windows.push(window);
    }

    pub async fn add_block(&self, block: ScheduleBlock) {
        self.inner.write().await.blocks.push(block);
    }

    /// Store an appointment as-is, bypassing every rule. Meant for fixtures.
    pub async fn seed_appointment(&self, appointment: Appointment) {
        self.inner
            .write()
            .await
            .appointments
            .insert(appointment.id, appointment);
    }
}

fn collides(
    appointments: &HashMap<Uuid, Appointment>,
    candidate: &Appointment,
    slot: Duration,
) -> bool {
    let start = candidate.start_time;
    let end = candidate.end_time(slot);

    appointments.values().any(|existing| {
        existing.id != candidate.id
            && existing.barber_id == candidate.barber_id
            && existing.is_active()
            && ranges_overlap(existing.start_time, existing.end_time(slot), start, end)
    })
}

fn active_for_client(appointments: &HashMap<Uuid, Appointment>, client_id: Uuid) -> usize {
    appointments
        .values()
        .filter(|a| a.client_id == client_id && a.is_active())
        .count()
}

fn sorted(mut appointments: Vec<Appointment>) -> Vec<Appointment> {
    appointments.sort_by_key(|a| a.start_time);
    appointments
}

#[async_trait]
impl AppointmentStore for InMemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.inner.read().await.appointments.get(&id).cloned())
    }

    async fn insert(
        &self,
        appointment: &Appointment,
        slot: Duration,
        max_active_per_client: u32,
    ) -> Result<Appointment, StoreError> {
        let mut inner = self.inner.write().await;

        if appointment.is_active() {
            let held = active_for_client(&inner.appointments, appointment.client_id);
            if held >= max_active_per_client as usize {
                debug!("Commit-time quota check failed for client {} ({} active)", appointment.client_id, held);
                return Err(StoreError::QuotaExceeded {
                    client_id: appointment.client_id,
                    max: max_active_per_client,
                });
            }
        }

        if appointment.is_active() && collides(&inner.appointments, appointment, slot) {
            debug!("Commit-time overlap for barber {} at {}", appointment.barber_id, appointment.start_time);
            return Err(StoreError::Conflict {
                barber_id: appointment.barber_id,
                start_time: appointment.start_time,
            });
        }

        inner.appointments.insert(appointment.id, appointment.clone());
        Ok(appointment.clone())
    }

    async fn update(
        &self,
        appointment: &Appointment,
        expected_state: AppointmentState,
        slot: Duration,
    ) -> Result<Appointment, StoreError> {
        let mut inner = self.inner.write().await;

        let current = inner
            .appointments
            .get(&appointment.id)
            .ok_or(StoreError::NotFound(appointment.id))?;

        if current.state != expected_state {
            return Err(StoreError::StaleState { id: appointment.id, expected: expected_state });
        }

        if appointment.is_active() && collides(&inner.appointments, appointment, slot) {
            return Err(StoreError::Conflict {
                barber_id: appointment.barber_id,
                start_time: appointment.start_time,
            });
        }

        inner.appointments.insert(appointment.id, appointment.clone());
        Ok(appointment.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .appointments
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_for_barber(
        &self,
        barber_id: Uuid,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(sorted(
            inner
                .appointments
                .values()
                .filter(|a| a.barber_id == barber_id && a.start_time >= from && a.start_time < to)
                .cloned()
                .collect(),
        ))
    }

    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(sorted(
            inner
                .appointments
                .values()
                .filter(|a| a.client_id == client_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_all_for_barber(&self, barber_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(sorted(
            inner
                .appointments
                .values()
                .filter(|a| a.barber_id == barber_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(sorted(inner.appointments.values().cloned().collect()))
    }

    async fn list_stale(&self, now: NaiveDateTime) -> Result<Vec<Appointment>, StoreError> {
        let inner = self.inner.read().await;
        Ok(sorted(
            inner
                .appointments
                .values()
                .filter(|a| a.is_active() && a.start_time < now)
                .cloned()
                .collect(),
        ))
    }

    async fn count_active_for_client(&self, client_id: Uuid) -> Result<usize, StoreError> {
        let inner = self.inner.read().await;
        Ok(active_for_client(&inner.appointments, client_id))
    }
}

#[async_trait]
impl ConfigStore for InMemoryStore {
    async fn get_values(&self, keys: &[&str]) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| inner.settings.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect())
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<DirectoryUser>, StoreError> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }
}

#[async_trait]
impl AvailabilityStore for InMemoryStore {
    async fn windows_for_barber(&self, barber_id: Uuid) -> Result<Vec<BarberAvailability>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .windows
            .iter()
            .filter(|w| w.barber_id == barber_id)
            .cloned()
            .collect())
    }

    async fn blocks_for_barber(
        &self,
        barber_id: Uuid,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<ScheduleBlock>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .blocks
            .iter()
            .filter(|b| b.barber_id == barber_id && ranges_overlap(b.start_time, b.end_time, from, to))
            .cloned()
            .collect())
    }
}
