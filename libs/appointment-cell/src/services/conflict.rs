// libs/appointment-cell/src/services/conflict.rs
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Appointment, OccupiedRange};
use crate::store::{ranges_overlap, AppointmentStore, StoreError};

pub struct ConflictDetectionService {
    store: Arc<dyn AppointmentStore>,
}

impl ConflictDetectionService {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    /// Whether `[start, end)` overlaps an active appointment of the barber.
    /// `exclude_appointment_id` lets an edit re-check without hitting itself.
    pub async fn has_conflict(
        &self,
        barber_id: Uuid,
        start: NaiveDateTime,
        end: NaiveDateTime,
        exclude_appointment_id: Option<Uuid>,
        slot: Duration,
    ) -> Result<bool, StoreError> {
        debug!("Checking conflicts for barber {} from {} to {}", barber_id, start, end);

        // Anything starting a full slot before `start` has already ended.
        let existing = self.store.list_for_barber(barber_id, start - slot, end).await?;
        let conflicts = find_conflicts(&existing, start, end, exclude_appointment_id, slot);

        if !conflicts.is_empty() {
            warn!("Conflict detected for barber {} - {} conflicting appointments", barber_id, conflicts.len());
        }

        Ok(!conflicts.is_empty())
    }

    /// Active bookings of a barber starting in `[from, to)`.
    pub async fn occupied_ranges(
        &self,
        barber_id: Uuid,
        from: NaiveDateTime,
        to: NaiveDateTime,
        slot: Duration,
    ) -> Result<Vec<OccupiedRange>, StoreError> {
        let appointments = self.store.list_for_barber(barber_id, from, to).await?;

        Ok(appointments
            .into_iter()
            .filter(Appointment::is_active)
            .map(|a| OccupiedRange {
                appointment_id: a.id,
                start: a.start_time,
                end: a.end_time(slot),
                state: a.state,
            })
            .collect())
    }
}

/// Active appointments overlapping `[start, end)` under half-open semantics.
pub fn find_conflicts<'a>(
    existing: &'a [Appointment],
    start: NaiveDateTime,
    end: NaiveDateTime,
    exclude_appointment_id: Option<Uuid>,
    slot: Duration,
) -> Vec<&'a Appointment> {
    existing
        .iter()
        .filter(|a| Some(a.id) != exclude_appointment_id)
        .filter(|a| a.is_active())
        .filter(|a| ranges_overlap(a.start_time, a.end_time(slot), start, end))
        .collect()
}
