use std::collections::HashSet;
use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use appointment_cell::models::*;
use appointment_cell::services::booking::AppointmentBookingService;
use appointment_cell::services::clock::FixedClock;
use appointment_cell::services::config::{CANCELLATION_NOTE_ENABLED, MAX_ADVANCE_DAYS, SLOT_DURATION_MINUTES};
use appointment_cell::services::notification::NotificationOutbox;
use appointment_cell::store::memory::InMemoryStore;
use appointment_cell::store::{AppointmentStore, SchedulingStores, StoreError};
use shared_models::auth::Role;

// Monday 2025-03-03; Tuesday 2025-03-04 is used for bookings.
fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, day).unwrap().and_hms_opt(h, m, 0).unwrap()
}

fn tuesday(h: u32, m: u32) -> NaiveDateTime {
    at(4, h, m)
}

struct Fixture {
    store: Arc<InMemoryStore>,
    clock: FixedClock,
    booking: Arc<AppointmentBookingService>,
    barber: Actor,
    client: Actor,
    admin: Actor,
}

async fn add_user(store: &InMemoryStore, name: &str, role: Role) -> Actor {
    let id = Uuid::new_v4();
    store
        .add_user(DirectoryUser {
            id,
            name: name.to_string(),
            email: Some(format!("{}@example.com", name.to_lowercase())),
            role,
            active: true,
        })
        .await;
    Actor::new(id, role)
}

async fn fixture() -> Fixture {
    let store = Arc::new(InMemoryStore::new());
    let clock = FixedClock::new(at(3, 8, 0));

    let barber = add_user(&store, "Luis", Role::Barber).await;
    let client = add_user(&store, "Ana", Role::Client).await;
    let admin = add_user(&store, "Admin", Role::Admin).await;

    let booking = Arc::new(AppointmentBookingService::new(
        SchedulingStores::from_backend(store.clone()),
        Arc::new(clock.clone()),
    ));

    Fixture { store, clock, booking, barber, client, admin }
}

fn request(barber: &Actor, start: NaiveDateTime) -> CreateAppointmentRequest {
    CreateAppointmentRequest { client_id: None, barber_id: barber.id, start_time: start }
}

async fn book(f: &Fixture, client: &Actor, start: NaiveDateTime) -> Result<Appointment, AppointmentError> {
    f.booking.create_appointment(request(&f.barber, start), client).await
}

fn rejection(result: Result<Appointment, AppointmentError>) -> Option<RejectionReason> {
    result.err().and_then(|e| e.reason())
}

// ==============================================================================
// CREATION RULES
// ==============================================================================

#[tokio::test]
async fn test_client_books_pending_appointment_for_themselves() {
    let f = fixture().await;

    let mut req = request(&f.barber, tuesday(10, 0));
    req.client_id = Some(Uuid::new_v4()); // ignored for clients
    let appointment = tokio_test::assert_ok!(f.booking.create_appointment(req, &f.client).await);

    assert_eq!(appointment.state, AppointmentState::Pending);
    assert_eq!(appointment.client_id, f.client.id);
    assert_eq!(appointment.modified_by, Some(f.client.audit()));
}

#[tokio::test]
async fn test_slot_must_end_by_window_close() {
    let f = fixture().await;

    assert_eq!(rejection(book(&f, &f.client, tuesday(12, 30)).await), Some(RejectionReason::OutsideBusinessHours));
    assert!(book(&f, &f.client, tuesday(12, 0)).await.is_ok());
}

#[tokio::test]
async fn test_lead_time_and_working_days() {
    let f = fixture().await;

    assert_eq!(rejection(book(&f, &f.client, at(3, 10, 0)).await), Some(RejectionReason::InsufficientLeadTime));
    assert_eq!(rejection(book(&f, &f.client, at(9, 10, 0)).await), Some(RejectionReason::NonWorkingDay));
}

#[tokio::test]
async fn test_identity_checks() {
    let f = fixture().await;

    let unknown = Actor::new(Uuid::new_v4(), Role::Barber);
    let result = f.booking.create_appointment(request(&unknown, tuesday(10, 0)), &f.client).await;
    assert_eq!(rejection(result), Some(RejectionReason::BarberNotFound));

    let not_a_barber = Actor::new(f.admin.id, Role::Barber);
    let result = f.booking.create_appointment(request(&not_a_barber, tuesday(10, 0)), &f.client).await;
    assert_eq!(rejection(result), Some(RejectionReason::BarberInvalidRole));

    let result = f.booking.create_appointment(request(&f.barber, tuesday(10, 0)), &f.admin).await;
    assert_eq!(rejection(result), Some(RejectionReason::ClientRequired));

    let mut for_barber = request(&f.barber, tuesday(10, 0));
    for_barber.client_id = Some(f.barber.id);
    let result = f.booking.create_appointment(for_barber, &f.admin).await;
    assert_eq!(rejection(result), Some(RejectionReason::ClientInvalidRole));

    let mut on_behalf = request(&f.barber, tuesday(10, 0));
    on_behalf.client_id = Some(f.client.id);
    let created = f.booking.create_appointment(on_behalf, &f.barber).await.unwrap();
    assert_eq!(created.client_id, f.client.id);
}

#[tokio::test]
async fn test_overlapping_request_is_rejected_as_slot_conflict() {
    let f = fixture().await;
    let other = add_user(&f.store, "Eva", Role::Client).await;

    book(&f, &f.client, tuesday(10, 0)).await.unwrap();

    let err = book(&f, &other, tuesday(10, 30)).await.unwrap_err();
    assert_matches!(err, AppointmentError::Rejected(RejectionReason::SlotConflict));
    assert!(!err.is_retryable());
    assert!(book(&f, &other, tuesday(11, 0)).await.is_ok());
}

#[tokio::test]
async fn test_barber_roster_and_blocks_are_enforced() {
    let f = fixture().await;

    f.store
        .add_window(BarberAvailability {
            id: Uuid::new_v4(),
            barber_id: f.barber.id,
            weekday: 2,
            start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            active: true,
        })
        .await;
    f.store
        .add_block(ScheduleBlock {
            id: Uuid::new_v4(),
            barber_id: f.barber.id,
            start_time: tuesday(11, 0),
            end_time: tuesday(12, 0),
            reason: Some("Dentist".to_string()),
        })
        .await;

    assert_eq!(rejection(book(&f, &f.client, tuesday(17, 0)).await), Some(RejectionReason::BarberUnavailable));
    assert_eq!(rejection(book(&f, &f.client, tuesday(11, 0)).await), Some(RejectionReason::SlotBlocked));
    assert!(book(&f, &f.client, tuesday(10, 0)).await.is_ok());
}

// ==============================================================================
// QUOTA AND CANCELLATION
// ==============================================================================

#[tokio::test]
async fn test_standing_quota_frees_up_on_cancel() {
    let f = fixture().await;

    let first = book(&f, &f.client, tuesday(10, 0)).await.unwrap();
    book(&f, &f.client, tuesday(11, 0)).await.unwrap();
    book(&f, &f.client, tuesday(12, 0)).await.unwrap();

    assert_eq!(rejection(book(&f, &f.client, tuesday(17, 0)).await), Some(RejectionReason::QuotaExceeded));

    f.booking.cancel_own_appointment(first.id, f.client.id, None).await.unwrap();
    assert!(book(&f, &f.client, tuesday(17, 0)).await.is_ok());
}

#[tokio::test]
async fn test_cancelled_slot_can_be_rebooked_immediately() {
    let f = fixture().await;
    let other = add_user(&f.store, "Eva", Role::Client).await;

    let appointment = book(&f, &f.client, tuesday(10, 0)).await.unwrap();
    f.booking.cancel_own_appointment(appointment.id, f.client.id, None).await.unwrap();

    let rebooked = book(&f, &other, tuesday(10, 0)).await.unwrap();
    assert_eq!(rebooked.start_time, tuesday(10, 0));
}

#[tokio::test]
async fn test_cancel_inside_notice_window_is_rejected() {
    let f = fixture().await;
    let appointment = book(&f, &f.client, tuesday(10, 0)).await.unwrap();

    f.clock.set(tuesday(9, 30));
    let result = f.booking.cancel_own_appointment(appointment.id, f.client.id, None).await;

    assert_eq!(rejection(result), Some(RejectionReason::CancellationWindowViolated));
}

#[tokio::test]
async fn test_cancel_ownership_and_terminal_checks() {
    let f = fixture().await;
    let other = add_user(&f.store, "Eva", Role::Client).await;
    let appointment = book(&f, &f.client, tuesday(10, 0)).await.unwrap();

    let err = f.booking.cancel_own_appointment(appointment.id, other.id, None).await.unwrap_err();
    assert_matches!(err, AppointmentError::Forbidden(RejectionReason::NotOwner));

    f.booking.cancel_own_appointment(appointment.id, f.client.id, None).await.unwrap();
    let again = f.booking.cancel_own_appointment(appointment.id, f.client.id, None).await;
    assert_eq!(rejection(again), Some(RejectionReason::AlreadyTerminal));

    let missing = f.booking.cancel_own_appointment(Uuid::new_v4(), f.client.id, None).await;
    assert_matches!(missing, Err(AppointmentError::NotFound(_)));
}

#[tokio::test]
async fn test_cancellation_note_requires_setting() {
    let f = fixture().await;
    let appointment = book(&f, &f.client, tuesday(10, 0)).await.unwrap();

    let result = f
        .booking
        .cancel_own_appointment(appointment.id, f.client.id, Some("Running late".to_string()))
        .await;
    assert_eq!(rejection(result), Some(RejectionReason::NoteNotAllowed));

    f.store.set_setting(CANCELLATION_NOTE_ENABLED, "true").await;
    let long_note = "n".repeat(MAX_NOTE_CHARS + 50);
    let cancelled = f
        .booking
        .cancel_own_appointment(appointment.id, f.client.id, Some(long_note))
        .await
        .unwrap();

    assert_eq!(cancelled.state, AppointmentState::Cancelled);
    assert_eq!(cancelled.note.unwrap().chars().count(), MAX_NOTE_CHARS);
}

// ==============================================================================
// STATE CHANGES, UPDATES, DELETES
// ==============================================================================

#[tokio::test]
async fn test_change_state_role_policy() {
    let f = fixture().await;
    let other_barber = add_user(&f.store, "Tomas", Role::Barber).await;
    let appointment = book(&f, &f.client, tuesday(10, 0)).await.unwrap();

    let err = f.booking.change_state(appointment.id, AppointmentState::Cancelled, &f.client, None).await.unwrap_err();
    assert_matches!(err, AppointmentError::Forbidden(RejectionReason::RoleNotPermitted));

    let err = f.booking.change_state(appointment.id, AppointmentState::Confirmed, &other_barber, None).await.unwrap_err();
    assert_matches!(err, AppointmentError::Forbidden(RejectionReason::NotOwner));

    let err = f.booking.change_state(appointment.id, AppointmentState::Expired, &f.barber, None).await.unwrap_err();
    assert_matches!(err, AppointmentError::Rejected(RejectionReason::InvalidStateTransition));

    let confirmed = f
        .booking
        .change_state(appointment.id, AppointmentState::Confirmed, &f.barber, Some("See you".to_string()))
        .await
        .unwrap();
    assert_eq!(confirmed.state, AppointmentState::Confirmed);
    assert_eq!(confirmed.modified_by, Some(f.barber.audit()));
    assert_eq!(confirmed.modified_at, Some(at(3, 8, 0)));

    f.booking.change_state(appointment.id, AppointmentState::Cancelled, &f.admin, None).await.unwrap();
    let err = f.booking.change_state(appointment.id, AppointmentState::Confirmed, &f.admin, None).await.unwrap_err();
    assert_matches!(err, AppointmentError::Rejected(RejectionReason::AlreadyTerminal));
}

#[tokio::test]
async fn test_update_revalidates_moved_appointment() {
    let f = fixture().await;
    let other = add_user(&f.store, "Eva", Role::Client).await;

    let first = book(&f, &f.client, tuesday(10, 0)).await.unwrap();
    book(&f, &other, tuesday(11, 0)).await.unwrap();

    let move_to = |start| UpdateAppointmentRequest { barber_id: f.barber.id, start_time: start, state: None };

    let err = f.booking.update_appointment(first.id, move_to(tuesday(10, 30)), &f.barber).await.unwrap_err();
    assert_matches!(err, AppointmentError::Rejected(RejectionReason::SlotConflict));

    let err = f.booking.update_appointment(first.id, move_to(tuesday(12, 30)), &f.barber).await.unwrap_err();
    assert_matches!(err, AppointmentError::Rejected(RejectionReason::OutsideBusinessHours));

    let err = f.booking.update_appointment(first.id, move_to(tuesday(12, 0)), &f.client).await.unwrap_err();
    assert_matches!(err, AppointmentError::Forbidden(RejectionReason::RoleNotPermitted));

    // Same slot plus a state change does not collide with itself.
    let confirmed = f
        .booking
        .update_appointment(
            first.id,
            UpdateAppointmentRequest {
                barber_id: f.barber.id,
                start_time: tuesday(10, 0),
                state: Some(AppointmentState::Confirmed),
            },
            &f.admin,
        )
        .await
        .unwrap();
    assert_eq!(confirmed.state, AppointmentState::Confirmed);

    let moved = f.booking.update_appointment(first.id, move_to(tuesday(12, 0)), &f.barber).await.unwrap();
    assert_eq!(moved.start_time, tuesday(12, 0));
}

#[tokio::test]
async fn test_delete_policy() {
    let f = fixture().await;
    let other_barber = add_user(&f.store, "Tomas", Role::Barber).await;
    let appointment = book(&f, &f.client, tuesday(10, 0)).await.unwrap();

    let err = f.booking.delete_appointment(appointment.id, &f.client).await.unwrap_err();
    assert_matches!(err, AppointmentError::Forbidden(RejectionReason::RoleNotPermitted));

    let err = f.booking.delete_appointment(appointment.id, &other_barber).await.unwrap_err();
    assert_matches!(err, AppointmentError::Forbidden(RejectionReason::NotOwner));

    f.booking.delete_appointment(appointment.id, &f.barber).await.unwrap();
    assert_matches!(
        f.booking.get_appointment(appointment.id, &f.admin).await,
        Err(AppointmentError::NotFound(_))
    );
}

#[tokio::test]
async fn test_listing_is_scoped_by_role() {
    let f = fixture().await;
    let other = add_user(&f.store, "Eva", Role::Client).await;
    let other_barber = add_user(&f.store, "Tomas", Role::Barber).await;

    book(&f, &f.client, tuesday(10, 0)).await.unwrap();
    book(&f, &other, tuesday(11, 0)).await.unwrap();

    assert_eq!(f.booking.list_appointments(&f.admin).await.unwrap().len(), 2);
    assert_eq!(f.booking.list_appointments(&f.barber).await.unwrap().len(), 2);
    assert_eq!(f.booking.list_appointments(&other_barber).await.unwrap().len(), 0);

    let own = f.booking.list_appointments(&f.client).await.unwrap();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].client_id, f.client.id);

    let err = f.booking.get_appointment(own[0].id, &other).await.unwrap_err();
    assert_matches!(err, AppointmentError::Forbidden(RejectionReason::NotOwner));
}

// ==============================================================================
// SLOTS AND OCCUPANCY
// ==============================================================================

#[tokio::test]
async fn test_available_slots_exclude_booked_ones() {
    let f = fixture().await;
    let date = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();

    let all = f.booking.list_available_slots(f.barber.id, date).await.unwrap();
    let labels: Vec<_> = all.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["10:00", "11:00", "12:00", "17:00", "18:00", "19:00", "20:00"]);
    assert_eq!(all[0].period, DayPeriod::Morning);
    assert_eq!(all[3].period, DayPeriod::Afternoon);

    book(&f, &f.client, tuesday(11, 0)).await.unwrap();

    let remaining = f.booking.list_available_slots(f.barber.id, date).await.unwrap();
    assert_eq!(remaining.len(), 6);
    assert!(remaining.iter().all(|s| s.start_time != tuesday(11, 0)));
}

#[tokio::test]
async fn test_no_slots_on_sunday_by_default() {
    let f = fixture().await;
    let sunday = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();

    assert!(f.booking.list_available_slots(f.barber.id, sunday).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_slots_follow_configured_duration() {
    let f = fixture().await;
    f.store.set_setting(SLOT_DURATION_MINUTES, "30").await;
    let date = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();

    let slots = f.booking.list_available_slots(f.barber.id, date).await.unwrap();
    assert_eq!(slots.len(), 14);
    assert_eq!(slots.last().unwrap().label, "20:30");
}

#[tokio::test]
async fn test_slot_range_spans_days_and_skips_sunday() {
    let f = fixture().await;
    let day = |d| NaiveDate::from_ymd_opt(2025, 3, d).unwrap();

    let two_days = f.booking.list_available_slots_range(f.barber.id, day(4), day(5)).await.unwrap();
    assert_eq!(two_days.len(), 14);
    assert_eq!(two_days.first().unwrap().start_time, tuesday(10, 0));
    assert_eq!(two_days.last().unwrap().start_time, at(5, 20, 0));

    book(&f, &f.client, at(5, 18, 0)).await.unwrap();
    let saturday_to_monday = f.booking.list_available_slots_range(f.barber.id, day(8), day(10)).await.unwrap();
    assert_eq!(saturday_to_monday.len(), 14);
    assert!(saturday_to_monday.iter().all(|s| s.start_time.date() != day(9)));

    let after_booking = f.booking.list_available_slots_range(f.barber.id, day(5), day(5)).await.unwrap();
    assert_eq!(after_booking.len(), 6);
}

#[tokio::test]
async fn test_slot_range_bounds() {
    let f = fixture().await;
    let day = |d| NaiveDate::from_ymd_opt(2025, 3, d).unwrap();

    let err = f.booking.list_available_slots_range(f.barber.id, day(6), day(5)).await.unwrap_err();
    assert_matches!(err, AppointmentError::Rejected(RejectionReason::InvalidDateRange));

    let err = f
        .booking
        .list_available_slots_range(f.barber.id, day(3), day(3) + Duration::days(MAX_SLOT_RANGE_DAYS))
        .await
        .unwrap_err();
    assert_matches!(err, AppointmentError::Rejected(RejectionReason::InvalidDateRange));

    let err = f.booking.list_available_slots_range(Uuid::new_v4(), day(4), day(5)).await.unwrap_err();
    assert_matches!(err, AppointmentError::Rejected(RejectionReason::BarberNotFound));

    f.store.set_setting(MAX_ADVANCE_DAYS, "7").await;
    let err = f.booking.list_available_slots_range(f.barber.id, day(4), day(13)).await.unwrap_err();
    assert_matches!(err, AppointmentError::Rejected(RejectionReason::BeyondMaxAdvance));
    assert!(f.booking.list_available_slots_range(f.barber.id, day(4), day(10)).await.is_ok());
}

#[tokio::test]
async fn test_occupied_ranges_only_report_active() {
    let f = fixture().await;

    let cancelled = book(&f, &f.client, tuesday(10, 0)).await.unwrap();
    f.booking.cancel_own_appointment(cancelled.id, f.client.id, None).await.unwrap();
    let active = book(&f, &f.client, tuesday(17, 0)).await.unwrap();

    let ranges = f
        .booking
        .list_occupied_ranges(f.barber.id, at(4, 0, 0), at(5, 0, 0))
        .await
        .unwrap();

    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].appointment_id, active.id);
    assert_eq!(ranges[0].end, tuesday(18, 0));
}

// ==============================================================================
// SWEEP
// ==============================================================================

#[tokio::test]
async fn test_sweep_closes_past_appointments_once() {
    let f = fixture().await;

    let pending = book(&f, &f.client, tuesday(10, 0)).await.unwrap();
    let confirmed = book(&f, &f.client, tuesday(11, 0)).await.unwrap();
    let future = book(&f, &f.client, tuesday(17, 0)).await.unwrap();
    f.booking.change_state(confirmed.id, AppointmentState::Confirmed, &f.barber, None).await.unwrap();

    f.clock.set(tuesday(12, 30));

    let first = f.booking.sweep_expired(f.clock_now()).await.unwrap();
    assert_eq!((first.expired_count, first.attended_count), (1, 1));

    let second = f.booking.sweep_expired(f.clock_now()).await.unwrap();
    assert_eq!((second.expired_count, second.attended_count), (0, 0));

    let expired = f.store.get(pending.id).await.unwrap().unwrap();
    assert_eq!(expired.state, AppointmentState::Expired);
    assert_eq!(expired.modified_by, Some(AuditActor::System));
    assert!(expired.note.is_some());

    assert_eq!(f.store.get(confirmed.id).await.unwrap().unwrap().state, AppointmentState::Attended);
    assert_eq!(f.store.get(future.id).await.unwrap().unwrap().state, AppointmentState::Pending);
}

#[tokio::test]
async fn test_sweep_leaves_terminal_rows_alone() {
    let f = fixture().await;

    let mut cancelled = Appointment::new_pending(f.client.id, f.barber.id, at(1, 10, 0), at(1, 8, 0));
    cancelled.state = AppointmentState::Cancelled;
    let stale = Appointment::new_pending(f.client.id, f.barber.id, at(1, 11, 0), at(1, 8, 0));
    f.store.seed_appointment(cancelled.clone()).await;
    f.store.seed_appointment(stale.clone()).await;

    let listed = f.booking.list_appointments(&f.admin).await.unwrap();

    let state_of = |id| listed.iter().find(|a| a.id == id).map(|a| a.state);
    assert_eq!(state_of(cancelled.id), Some(AppointmentState::Cancelled));
    assert_eq!(state_of(stale.id), Some(AppointmentState::Expired));
}

#[tokio::test]
async fn test_reads_reflect_sweep_without_explicit_call() {
    let f = fixture().await;
    let appointment = book(&f, &f.client, tuesday(10, 0)).await.unwrap();

    f.clock.advance(Duration::days(1));

    let seen = f.booking.get_appointment(appointment.id, &f.client).await.unwrap();
    assert_eq!(seen.state, AppointmentState::Expired);
}

/// Fails every update of one appointment and delegates everything else.
struct FaultyStore {
    inner: Arc<InMemoryStore>,
    broken: Uuid,
}

#[async_trait]
impl AppointmentStore for FaultyStore {
    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, appointment: &Appointment, slot: Duration, max_active_per_client: u32) -> Result<Appointment, StoreError> {
        self.inner.insert(appointment, slot, max_active_per_client).await
    }

    async fn update(
        &self,
        appointment: &Appointment,
        expected_state: AppointmentState,
        slot: Duration,
    ) -> Result<Appointment, StoreError> {
        if appointment.id == self.broken {
            return Err(StoreError::Backend("disk on fire".to_string()));
        }
        self.inner.update(appointment, expected_state, slot).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn list_for_barber(&self, barber_id: Uuid, from: NaiveDateTime, to: NaiveDateTime) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_for_barber(barber_id, from, to).await
    }

    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_for_client(client_id).await
    }

    async fn list_all_for_barber(&self, barber_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_all_for_barber(barber_id).await
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_all().await
    }

    async fn list_stale(&self, now: NaiveDateTime) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_stale(now).await
    }

    async fn count_active_for_client(&self, client_id: Uuid) -> Result<usize, StoreError> {
        self.inner.count_active_for_client(client_id).await
    }
}

#[tokio::test]
async fn test_sweep_isolates_failing_rows() {
    let f = fixture().await;
    let broken = book(&f, &f.client, tuesday(10, 0)).await.unwrap();
    let healthy = book(&f, &f.client, tuesday(11, 0)).await.unwrap();

    let mut stores = SchedulingStores::from_backend(f.store.clone());
    stores.appointments = Arc::new(FaultyStore { inner: f.store.clone(), broken: broken.id });
    let clock = FixedClock::new(tuesday(13, 0));
    let booking = AppointmentBookingService::new(stores, Arc::new(clock.clone()));

    let report = booking.sweep_expired(clock_now(&clock)).await.unwrap();
    assert_eq!(report.expired_count, 1);
    assert_eq!(report.failed_count, 1);

    assert_eq!(f.store.get(healthy.id).await.unwrap().unwrap().state, AppointmentState::Expired);
    assert_eq!(f.store.get(broken.id).await.unwrap().unwrap().state, AppointmentState::Pending);
}

// ==============================================================================
// CONCURRENCY
// ==============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_double_booking_has_one_winner() {
    let f = fixture().await;
    let other = add_user(&f.store, "Eva", Role::Client).await;

    let tasks = [f.client, other].map(|client| {
        let booking = Arc::clone(&f.booking);
        let req = request(&f.barber, tuesday(10, 0));
        tokio::spawn(async move { booking.create_appointment(req, &client).await })
    });

    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(loser.code(), "SLOT_CONFLICT");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_appointments_never_overlap() {
    let f = fixture().await;

    let mut clients = Vec::new();
    for i in 0..12 {
        clients.push(add_user(&f.store, &format!("Client{}", i), Role::Client).await);
    }

    // Every 15 minutes through the afternoon window, all at once.
    let tasks: Vec<_> = clients
        .iter()
        .enumerate()
        .map(|(i, client)| {
            let booking = Arc::clone(&f.booking);
            let client = *client;
            let start = tuesday(17, 0) + Duration::minutes(15 * i as i64);
            let req = request(&f.barber, start);
            tokio::spawn(async move { booking.create_appointment(req, &client).await })
        })
        .collect();
    futures::future::join_all(tasks).await;

    let slot = Duration::minutes(60);
    let active: Vec<_> = f
        .store
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .filter(Appointment::is_active)
        .collect();

    assert!(!active.is_empty());
    for (i, a) in active.iter().enumerate() {
        for b in active.iter().skip(i + 1) {
            assert!(
                !(a.start_time < b.end_time(slot) && a.end_time(slot) > b.start_time),
                "{} overlaps {}",
                a.start_time,
                b.start_time
            );
        }
    }

    let ids: HashSet<_> = active.iter().map(|a| a.id).collect();
    assert_eq!(ids.len(), active.len());
}

/// Stalls the quota count so concurrent creates all pass the pre-check.
struct SlowCountStore {
    inner: Arc<InMemoryStore>,
}

#[async_trait]
impl AppointmentStore for SlowCountStore {
    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, appointment: &Appointment, slot: Duration, max_active_per_client: u32) -> Result<Appointment, StoreError> {
        self.inner.insert(appointment, slot, max_active_per_client).await
    }

    async fn update(
        &self,
        appointment: &Appointment,
        expected_state: AppointmentState,
        slot: Duration,
    ) -> Result<Appointment, StoreError> {
        self.inner.update(appointment, expected_state, slot).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn list_for_barber(&self, barber_id: Uuid, from: NaiveDateTime, to: NaiveDateTime) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_for_barber(barber_id, from, to).await
    }

    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_for_client(client_id).await
    }

    async fn list_all_for_barber(&self, barber_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_all_for_barber(barber_id).await
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_all().await
    }

    async fn list_stale(&self, now: NaiveDateTime) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_stale(now).await
    }

    async fn count_active_for_client(&self, client_id: Uuid) -> Result<usize, StoreError> {
        let count = self.inner.count_active_for_client(client_id).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        count
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_respect_client_quota() {
    let f = fixture().await;

    let mut stores = SchedulingStores::from_backend(f.store.clone());
    stores.appointments = Arc::new(SlowCountStore { inner: f.store.clone() });
    let booking = Arc::new(AppointmentBookingService::new(stores, Arc::new(f.clock.clone())));

    let starts = [tuesday(10, 0), tuesday(11, 0), tuesday(12, 0), tuesday(17, 0), tuesday(18, 0), tuesday(19, 0)];
    let tasks: Vec<_> = starts
        .into_iter()
        .map(|start| {
            let booking = Arc::clone(&booking);
            let client = f.client;
            let req = request(&f.barber, start);
            tokio::spawn(async move { booking.create_appointment(req, &client).await })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    for err in results.into_iter().filter_map(Result::err) {
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }
    assert_eq!(f.store.count_active_for_client(f.client.id).await.unwrap(), 3);
}

// ==============================================================================
// NOTIFICATIONS
// ==============================================================================

#[tokio::test]
async fn test_confirmation_is_published_after_commit() {
    let store = Arc::new(InMemoryStore::new());
    let barber = add_user(&store, "Luis", Role::Barber).await;
    let client = add_user(&store, "Ana", Role::Client).await;
    let clock = FixedClock::new(at(3, 8, 0));

    let (outbox, mut rx) = NotificationOutbox::channel();
    let booking = AppointmentBookingService::new(SchedulingStores::from_backend(store.clone()), Arc::new(clock))
        .with_outbox(outbox);

    let appointment = booking.create_appointment(request(&barber, tuesday(10, 0)), &client).await.unwrap();
    assert!(rx.try_recv().is_err());

    booking.change_state(appointment.id, AppointmentState::Confirmed, &barber, None).await.unwrap();

    let notification = rx.try_recv().unwrap();
    assert_eq!(notification.appointment_id, appointment.id);
    assert_eq!(notification.new_state, AppointmentState::Confirmed);
    assert_eq!(notification.barber_name, "Luis");
    assert_eq!(notification.client_email.as_deref(), Some("ana@example.com"));
    assert_eq!(notification.slot_end, tuesday(11, 0));
}

fn clock_now(clock: &FixedClock) -> NaiveDateTime {
    use appointment_cell::services::clock::Clock;
    clock.now()
}

impl Fixture {
    fn clock_now(&self) -> NaiveDateTime {
        clock_now(&self.clock)
    }
}
