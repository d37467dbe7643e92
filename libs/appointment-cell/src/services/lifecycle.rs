// libs/appointment-cell/src/services/lifecycle.rs
use chrono::NaiveDateTime;
use tracing::{debug, warn};

use shared_models::auth::Role;

use crate::models::{
    Actor, Appointment, AppointmentError, AppointmentState, AuditActor, RejectionReason,
    SchedulingConfig, MAX_NOTE_CHARS,
};

const EXPIRED_NOTE: &str = "Expired automatically: the appointment was never confirmed";
const ATTENDED_NOTE: &str = "Marked attended automatically after its start time";

pub struct AppointmentLifecycleService;

impl Default for AppointmentLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// All next states reachable from `current`, manual or automatic.
    pub fn get_valid_transitions(&self, current: AppointmentState) -> &'static [AppointmentState] {
        match current {
            AppointmentState::Pending => &[
                AppointmentState::Confirmed,
                AppointmentState::Cancelled,
                AppointmentState::Expired,
            ],
            AppointmentState::Confirmed => &[
                AppointmentState::Cancelled,
                AppointmentState::Attended,
            ],
            // Terminal states - no transitions allowed
            AppointmentState::Cancelled
            | AppointmentState::Expired
            | AppointmentState::Attended => &[],
        }
    }

    /// Expired and Attended are assigned by the sweep only.
    pub fn is_manual_target(&self, state: AppointmentState) -> bool {
        matches!(state, AppointmentState::Confirmed | AppointmentState::Cancelled)
    }

    pub fn validate_manual_transition(
        &self,
        current: AppointmentState,
        new_state: AppointmentState,
    ) -> Result<(), RejectionReason> {
        debug!("Validating state transition from {} to {}", current, new_state);

        if current.is_terminal() {
            return Err(RejectionReason::AlreadyTerminal);
        }

        if !self.is_manual_target(new_state) || !self.get_valid_transitions(current).contains(&new_state) {
            warn!("Invalid state transition attempted: {} -> {}", current, new_state);
            return Err(RejectionReason::InvalidStateTransition);
        }

        Ok(())
    }

    /// Staff may act on their own appointments, admins on any. Clients go
    /// through the self-service cancellation instead.
    pub fn authorize_staff(&self, actor: &Actor, appointment: &Appointment) -> Result<(), AppointmentError> {
        match actor.role {
            Role::Admin => Ok(()),
            Role::Barber if appointment.barber_id == actor.id => Ok(()),
            Role::Barber => Err(AppointmentError::Forbidden(RejectionReason::NotOwner)),
            Role::Client => Err(AppointmentError::Forbidden(RejectionReason::RoleNotPermitted)),
        }
    }

    /// Whether the actor may see the appointment at all.
    pub fn can_view(&self, actor: &Actor, appointment: &Appointment) -> bool {
        match actor.role {
            Role::Admin => true,
            Role::Barber => appointment.barber_id == actor.id,
            Role::Client => appointment.client_id == actor.id,
        }
    }

    /// Clients must cancel at least `min_cancel_notice_hours` ahead.
    pub fn check_cancellation_window(
        &self,
        start: NaiveDateTime,
        now: NaiveDateTime,
        config: &SchedulingConfig,
    ) -> Result<(), RejectionReason> {
        if start - now < config.min_cancel_notice() {
            return Err(RejectionReason::CancellationWindowViolated);
        }
        Ok(())
    }

    /// The state the sweep would assign, if any.
    pub fn automatic_transition(&self, appointment: &Appointment, now: NaiveDateTime) -> Option<AppointmentState> {
        if appointment.start_time >= now {
            return None;
        }

        match appointment.state {
            AppointmentState::Pending => Some(AppointmentState::Expired),
            AppointmentState::Confirmed => Some(AppointmentState::Attended),
            _ => None,
        }
    }

    pub fn apply_manual(
        &self,
        appointment: &Appointment,
        new_state: AppointmentState,
        by: AuditActor,
        note: Option<&str>,
        now: NaiveDateTime,
    ) -> Appointment {
        let mut next = appointment.clone();
        next.state = new_state;
        if let Some(note) = truncate_note(note) {
            next.note = Some(note);
        }
        next.stamp(by, now);
        next
    }

    pub fn apply_automatic(&self, appointment: &Appointment, new_state: AppointmentState, now: NaiveDateTime) -> Appointment {
        let mut next = appointment.clone();
        next.state = new_state;
        if next.note.is_none() {
            next.note = Some(match new_state {
                AppointmentState::Expired => EXPIRED_NOTE.to_string(),
                _ => ATTENDED_NOTE.to_string(),
            });
        }
        next.stamp(AuditActor::System, now);
        next
    }
}

/// Trim a note and cut it to the stored length. Blank notes become `None`.
pub fn truncate_note(note: Option<&str>) -> Option<String> {
    let trimmed = note?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_NOTE_CHARS).collect())
}
