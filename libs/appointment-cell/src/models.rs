// libs/appointment-cell/src/models.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use std::fmt;

use shared_models::auth::{Role, User};

/// Upper bound for free-text notes stored on an appointment.
pub const MAX_NOTE_CHARS: usize = 500;

/// Longest day range a slot listing may cover.
pub const MAX_SLOT_RANGE_DAYS: i64 = 31;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

/// A booked barber/client slot. Times are shop-local wall-clock values.
///
/// The slot length is not stored: it is derived from the scheduling
/// configuration whenever the end of the slot is needed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub client_id: Uuid,
    pub barber_id: Uuid,
    pub start_time: NaiveDateTime,
    pub state: AppointmentState,
    pub note: Option<String>,
    pub modified_by: Option<AuditActor>,
    pub modified_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl Appointment {
    pub fn new_pending(client_id: Uuid, barber_id: Uuid, start_time: NaiveDateTime, now: NaiveDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id,
            barber_id,
            start_time,
            state: AppointmentState::Pending,
            note: None,
            modified_by: None,
            modified_at: None,
            created_at: now,
        }
    }

    pub fn end_time(&self, slot: Duration) -> NaiveDateTime {
        self.start_time + slot
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Record who touched the appointment last and when.
    pub fn stamp(&mut self, by: AuditActor, at: NaiveDateTime) {
        self.modified_by = Some(by);
        self.modified_at = Some(at);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentState {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
    Attended,
}

impl AppointmentState {
    /// Numeric identifier used by the persistent store.
    pub fn id(&self) -> i16 {
        match self {
            AppointmentState::Pending => 1,
            AppointmentState::Confirmed => 2,
            AppointmentState::Cancelled => 3,
            AppointmentState::Expired => 4,
            AppointmentState::Attended => 5,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AppointmentState::Pending),
            2 => Some(AppointmentState::Confirmed),
            3 => Some(AppointmentState::Cancelled),
            4 => Some(AppointmentState::Expired),
            5 => Some(AppointmentState::Attended),
            _ => None,
        }
    }

    /// Active appointments occupy their slot and count against the quota.
    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentState::Pending | AppointmentState::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for AppointmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppointmentState::Pending => write!(f, "pending"),
            AppointmentState::Confirmed => write!(f, "confirmed"),
            AppointmentState::Cancelled => write!(f, "cancelled"),
            AppointmentState::Expired => write!(f, "expired"),
            AppointmentState::Attended => write!(f, "attended"),
        }
    }
}

/// Author of the last modification of an appointment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditActor {
    System,
    User { id: Uuid, role: Role },
}

/// The authenticated caller of a scheduling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Uuid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn audit(&self) -> AuditActor {
        AuditActor::User { id: self.id, role: self.role }
    }
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self { id: user.id, role: user.role }
    }
}

/// A user as seen through the user directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectoryUser {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub role: Role,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

// ==============================================================================
// AVAILABILITY MODELS
// ==============================================================================

/// Recurring weekly working window of a barber, `[start_time, end_time)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BarberAvailability {
    pub id: Uuid,
    pub barber_id: Uuid,
    pub weekday: u8, // 0 = Sunday, 1 = Monday, ... 6 = Saturday
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub active: bool,
}

/// Absolute range in which a barber takes no appointments, `[start_time, end_time)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleBlock {
    pub id: Uuid,
    pub barber_id: Uuid,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub reason: Option<String>,
}

// ==============================================================================
// SCHEDULING CONFIGURATION
// ==============================================================================

/// An opening window of the shop. `last_start` may be tighter than `close`
/// so that a slot started at `last_start` still ends before closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub last_start: NaiveTime,
}

impl BusinessWindow {
    pub fn fits(&self, start: NaiveTime, slot: Duration) -> bool {
        if start < self.open || start > self.last_start {
            return false;
        }
        // Slots never span midnight; overflowing the day means it does not fit.
        let (end, wrapped) = start.overflowing_add_signed(slot);
        wrapped == 0 && end <= self.close
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DayPeriod {
    Morning,
    Afternoon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingConfig {
    pub slot_duration_minutes: u32,
    pub max_active_per_client: u32,
    pub min_lead_hours: u32,
    pub min_cancel_notice_hours: u32,
    pub morning: BusinessWindow,
    pub afternoon: BusinessWindow,
    pub working_days: Vec<Weekday>,
    pub cancellation_note_enabled: bool,
    pub max_advance_days: Option<u32>,
}

impl SchedulingConfig {
    pub fn slot_duration(&self) -> Duration {
        Duration::minutes(self.slot_duration_minutes as i64)
    }

    pub fn min_lead(&self) -> Duration {
        Duration::hours(self.min_lead_hours as i64)
    }

    pub fn min_cancel_notice(&self) -> Duration {
        Duration::hours(self.min_cancel_notice_hours as i64)
    }

    pub fn windows(&self) -> [(DayPeriod, BusinessWindow); 2] {
        [
            (DayPeriod::Morning, self.morning),
            (DayPeriod::Afternoon, self.afternoon),
        ]
    }

    pub fn is_working_day(&self, day: Weekday) -> bool {
        self.working_days.contains(&day)
    }
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppointmentRequest {
    /// Ignored when the caller is a client: clients always book for themselves.
    pub client_id: Option<Uuid>,
    pub barber_id: Uuid,
    pub start_time: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAppointmentRequest {
    pub barber_id: Uuid,
    pub start_time: NaiveDateTime,
    pub state: Option<AppointmentState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStateRequest {
    pub state: AppointmentState,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelAppointmentRequest {
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableSlotsQuery {
    pub barber_id: Uuid,
    pub date: NaiveDate,
}

/// Inclusive day range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableSlotsRangeQuery {
    pub barber_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupiedRangesQuery {
    pub barber_id: Uuid,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvailableSlot {
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub label: String,
    pub period: DayPeriod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OccupiedRange {
    pub appointment_id: Uuid,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub state: AppointmentState,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_count: usize,
    pub attended_count: usize,
    pub failed_count: usize,
}

/// Post-commit message describing a state change the client should hear about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChangeNotification {
    pub appointment_id: Uuid,
    pub client_name: String,
    pub client_email: Option<String>,
    pub barber_name: String,
    pub slot_start: NaiveDateTime,
    pub slot_end: NaiveDateTime,
    pub new_state: AppointmentState,
    pub note: Option<String>,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

/// Machine-checkable reason a scheduling request was turned down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    #[error("The requested time is outside business hours")]
    OutsideBusinessHours,

    #[error("The shop is closed on the requested day")]
    NonWorkingDay,

    #[error("Appointments must be booked further in advance")]
    InsufficientLeadTime,

    #[error("The requested time is too far in the future")]
    BeyondMaxAdvance,

    #[error("The date range is empty or too long")]
    InvalidDateRange,

    #[error("Barber not found")]
    BarberNotFound,

    #[error("The selected user is not a barber")]
    BarberInvalidRole,

    #[error("The barber does not work at the requested time")]
    BarberUnavailable,

    #[error("The barber has blocked the requested time")]
    SlotBlocked,

    #[error("A client is required when the caller is not a client")]
    ClientRequired,

    #[error("Client not found")]
    ClientNotFound,

    #[error("The selected user is not a client")]
    ClientInvalidRole,

    #[error("The client already holds the maximum number of active appointments")]
    QuotaExceeded,

    #[error("The barber already has an appointment in that slot")]
    SlotConflict,

    #[error("The appointment belongs to someone else")]
    NotOwner,

    #[error("This role may not perform the operation")]
    RoleNotPermitted,

    #[error("The requested state change is not allowed")]
    InvalidStateTransition,

    #[error("The appointment is too close to be cancelled")]
    CancellationWindowViolated,

    #[error("The appointment is already closed")]
    AlreadyTerminal,

    #[error("Cancellation notes are not enabled")]
    NoteNotAllowed,
}

impl RejectionReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::OutsideBusinessHours => "OUTSIDE_BUSINESS_HOURS",
            RejectionReason::NonWorkingDay => "NON_WORKING_DAY",
            RejectionReason::InsufficientLeadTime => "INSUFFICIENT_LEAD_TIME",
            RejectionReason::BeyondMaxAdvance => "BEYOND_MAX_ADVANCE",
            RejectionReason::InvalidDateRange => "INVALID_DATE_RANGE",
            RejectionReason::BarberNotFound => "BARBER_NOT_FOUND",
            RejectionReason::BarberInvalidRole => "BARBER_INVALID_ROLE",
            RejectionReason::BarberUnavailable => "BARBER_UNAVAILABLE",
            RejectionReason::SlotBlocked => "SLOT_BLOCKED",
            RejectionReason::ClientRequired => "CLIENT_REQUIRED",
            RejectionReason::ClientNotFound => "CLIENT_NOT_FOUND",
            RejectionReason::ClientInvalidRole => "CLIENT_INVALID_ROLE",
            RejectionReason::QuotaExceeded => "QUOTA_EXCEEDED",
            RejectionReason::SlotConflict => "SLOT_CONFLICT",
            RejectionReason::NotOwner => "NOT_OWNER",
            RejectionReason::RoleNotPermitted => "ROLE_NOT_PERMITTED",
            RejectionReason::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            RejectionReason::CancellationWindowViolated => "CANCELLATION_WINDOW_VIOLATED",
            RejectionReason::AlreadyTerminal => "ALREADY_TERMINAL",
            RejectionReason::NoteNotAllowed => "NOTE_NOT_ALLOWED",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppointmentError {
    #[error("{0}")]
    Rejected(RejectionReason),

    #[error("{0}")]
    Forbidden(RejectionReason),

    #[error("Appointment {0} not found")]
    NotFound(Uuid),

    /// The store refused the write because another booking committed first.
    #[error("The slot was taken by a concurrent booking")]
    ConcurrentBooking,

    #[error("The appointment was modified concurrently")]
    ConcurrentModification,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl AppointmentError {
    pub fn code(&self) -> &'static str {
        match self {
            AppointmentError::Rejected(reason) | AppointmentError::Forbidden(reason) => reason.code(),
            AppointmentError::NotFound(_) => "APPOINTMENT_NOT_FOUND",
            AppointmentError::ConcurrentBooking => RejectionReason::SlotConflict.code(),
            AppointmentError::ConcurrentModification => "CONCURRENT_MODIFICATION",
            AppointmentError::Storage(_) => "INTERNAL_ERROR",
        }
    }

    pub fn reason(&self) -> Option<RejectionReason> {
        match self {
            AppointmentError::Rejected(reason) | AppointmentError::Forbidden(reason) => Some(*reason),
            AppointmentError::ConcurrentBooking => Some(RejectionReason::SlotConflict),
            _ => None,
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppointmentError::ConcurrentBooking | AppointmentError::ConcurrentModification)
    }
}

impl From<RejectionReason> for AppointmentError {
    fn from(reason: RejectionReason) -> Self {
        AppointmentError::Rejected(reason)
    }
}
