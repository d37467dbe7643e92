// libs/appointment-cell/src/services/validator.rs
use chrono::{Datelike, Duration, NaiveDateTime};
use tracing::debug;

use crate::models::{RejectionReason, SchedulingConfig};
use crate::services::availability::BarberSchedule;

/// Decides whether a start time is bookable. Checks run in a fixed order and
/// stop at the first failure.
pub struct SlotValidator;

impl SlotValidator {
    pub fn validate(
        start: NaiveDateTime,
        now: NaiveDateTime,
        config: &SchedulingConfig,
    ) -> Result<(), RejectionReason> {
        let slot = config.slot_duration();

        if !config.windows().iter().any(|(_, w)| w.fits(start.time(), slot)) {
            debug!("Start {} does not fit any business window", start);
            return Err(RejectionReason::OutsideBusinessHours);
        }

        if !config.is_working_day(start.weekday()) {
            return Err(RejectionReason::NonWorkingDay);
        }

        if start <= now + config.min_lead() {
            return Err(RejectionReason::InsufficientLeadTime);
        }

        if let Some(days) = config.max_advance_days {
            if start - now > Duration::days(days as i64) {
                return Err(RejectionReason::BeyondMaxAdvance);
            }
        }

        Ok(())
    }

    /// Shop rules plus the barber's own roster and blocks.
    pub fn validate_for_barber(
        start: NaiveDateTime,
        now: NaiveDateTime,
        config: &SchedulingConfig,
        schedule: &BarberSchedule,
    ) -> Result<(), RejectionReason> {
        Self::validate(start, now, config)?;
        Self::validate_barber_schedule(start, config, schedule)
    }

    /// Roster and block checks alone, for callers that already ran `validate`.
    pub fn validate_barber_schedule(
        start: NaiveDateTime,
        config: &SchedulingConfig,
        schedule: &BarberSchedule,
    ) -> Result<(), RejectionReason> {
        if schedule.has_roster() && !schedule.is_within_recurring_availability(start) {
            return Err(RejectionReason::BarberUnavailable);
        }

        if schedule.is_blocked(start, start + config.slot_duration()) {
            return Err(RejectionReason::SlotBlocked);
        }

        Ok(())
    }
}
