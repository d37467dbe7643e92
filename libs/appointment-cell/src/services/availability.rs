// libs/appointment-cell/src/services/availability.rs
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::models::{BarberAvailability, DayPeriod, SchedulingConfig, ScheduleBlock};
use crate::store::{ranges_overlap, AvailabilityStore, StoreError};

/// Weekday index used by availability rows: 0 = Sunday .. 6 = Saturday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Recurring windows and blocks of one barber over a range of interest.
#[derive(Debug, Clone, Default)]
pub struct BarberSchedule {
    pub windows: Vec<BarberAvailability>,
    pub blocks: Vec<ScheduleBlock>,
}

impl BarberSchedule {
    /// Barbers without any active window are governed by business hours alone.
    pub fn has_roster(&self) -> bool {
        self.windows.iter().any(|w| w.active)
    }

    /// An active window on the start's weekday contains its time of day,
    /// `window.start <= t < window.end`.
    pub fn is_within_recurring_availability(&self, start: NaiveDateTime) -> bool {
        let weekday = weekday_index(start.date());
        let time = start.time();

        self.windows
            .iter()
            .any(|w| w.active && w.weekday == weekday && w.start_time <= time && time < w.end_time)
    }

    pub fn is_blocked(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.blocks
            .iter()
            .any(|b| ranges_overlap(b.start_time, b.end_time, start, end))
    }
}

pub struct AvailabilityService {
    store: Arc<dyn AvailabilityStore>,
}

impl AvailabilityService {
    pub fn new(store: Arc<dyn AvailabilityStore>) -> Self {
        Self { store }
    }

    pub async fn schedule_for(
        &self,
        barber_id: Uuid,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<BarberSchedule, StoreError> {
        let windows = self.store.windows_for_barber(barber_id).await?;
        let blocks = self.store.blocks_for_barber(barber_id, from, to).await?;

        debug!(
            "Barber {} has {} availability windows and {} blocks in range",
            barber_id,
            windows.len(),
            blocks.len()
        );

        Ok(BarberSchedule { windows, blocks })
    }
}

/// Every slot start the business windows allow on `date`, in order.
/// Empty on non-working days.
pub fn candidate_starts(config: &SchedulingConfig, date: NaiveDate) -> Vec<(DayPeriod, NaiveDateTime)> {
    if !config.is_working_day(date.weekday()) {
        return Vec::new();
    }

    let slot = config.slot_duration();
    let mut starts = Vec::new();

    for (period, window) in config.windows() {
        let mut cursor = date.and_time(window.open);
        while cursor.date() == date && window.fits(cursor.time(), slot) {
            starts.push((period, cursor));
            cursor += slot;
        }
    }

    starts
}
