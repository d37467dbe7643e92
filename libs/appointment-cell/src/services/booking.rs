// libs/appointment-cell/src/services/booking.rs
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_models::auth::Role;

use crate::models::{
    Actor, Appointment, AppointmentError, AppointmentState, AuditActor, AvailableSlot,
    CreateAppointmentRequest, OccupiedRange, RejectionReason, SchedulingConfig,
    StateChangeNotification, SweepReport, UpdateAppointmentRequest, MAX_SLOT_RANGE_DAYS,
};
use crate::services::availability::{candidate_starts, AvailabilityService};
use crate::services::clock::Clock;
use crate::services::config::ConfigProvider;
use crate::services::conflict::{find_conflicts, ConflictDetectionService};
use crate::services::lifecycle::{truncate_note, AppointmentLifecycleService};
use crate::services::notification::NotificationOutbox;
use crate::services::quota::QuotaEnforcer;
use crate::services::validator::SlotValidator;
use crate::store::{SchedulingStores, StoreError};

/// Entry point for every scheduling operation. The configuration is resolved
/// once per call and threaded through the checks.
pub struct AppointmentBookingService {
    stores: SchedulingStores,
    config_provider: ConfigProvider,
    availability_service: AvailabilityService,
    conflict_service: ConflictDetectionService,
    quota_enforcer: QuotaEnforcer,
    lifecycle_service: AppointmentLifecycleService,
    clock: Arc<dyn Clock>,
    outbox: Option<NotificationOutbox>,
}

impl AppointmentBookingService {
    pub fn new(stores: SchedulingStores, clock: Arc<dyn Clock>) -> Self {
        Self {
            config_provider: ConfigProvider::new(Arc::clone(&stores.config)),
            availability_service: AvailabilityService::new(Arc::clone(&stores.availability)),
            conflict_service: ConflictDetectionService::new(Arc::clone(&stores.appointments)),
            quota_enforcer: QuotaEnforcer::new(Arc::clone(&stores.appointments)),
            lifecycle_service: AppointmentLifecycleService::new(),
            stores,
            clock,
            outbox: None,
        }
    }

    pub fn with_outbox(mut self, outbox: NotificationOutbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub async fn scheduling_config(&self) -> Result<SchedulingConfig, AppointmentError> {
        Ok(self.config_provider.load().await?)
    }

    // ==============================================================================
    // CREATE / UPDATE
    // ==============================================================================

    #[instrument(skip(self, request), fields(barber_id = %request.barber_id, start = %request.start_time))]
    pub async fn create_appointment(
        &self,
        request: CreateAppointmentRequest,
        actor: &Actor,
    ) -> Result<Appointment, AppointmentError> {
        let config = self.scheduling_config().await?;
        let now = self.now();
        let slot = config.slot_duration();
        let start = request.start_time;

        SlotValidator::validate(start, now, &config)?;

        let client_id = match actor.role {
            Role::Client => actor.id,
            Role::Barber | Role::Admin => request.client_id.ok_or(RejectionReason::ClientRequired)?,
        };

        self.ensure_user_with_role(request.barber_id, Role::Barber).await?;
        self.ensure_user_with_role(client_id, Role::Client).await?;

        let schedule = self
            .availability_service
            .schedule_for(request.barber_id, start, start + slot)
            .await?;
        SlotValidator::validate_barber_schedule(start, &config, &schedule)?;

        if self
            .conflict_service
            .has_conflict(request.barber_id, start, start + slot, None, slot)
            .await?
        {
            return Err(RejectionReason::SlotConflict.into());
        }

        self.quota_enforcer.ensure_capacity(client_id, &config).await?;

        let mut appointment = Appointment::new_pending(client_id, request.barber_id, start, now);
        appointment.stamp(actor.audit(), now);

        let saved = self
            .stores
            .appointments
            .insert(&appointment, slot, config.max_active_per_client)
            .await
            .map_err(commit_error)?;

        info!("Appointment {} booked for client {} with barber {}", saved.id, client_id, saved.barber_id);
        Ok(saved)
    }

    /// Staff edit of time, barber and optionally state. A moved appointment
    /// is re-validated like a new booking, ignoring itself for overlap.
    #[instrument(skip(self, request, actor), fields(appointment_id = %id))]
    pub async fn update_appointment(
        &self,
        id: Uuid,
        request: UpdateAppointmentRequest,
        actor: &Actor,
    ) -> Result<Appointment, AppointmentError> {
        let current = self.fetch(id).await?;
        self.lifecycle_service.authorize_staff(actor, &current)?;

        let config = self.scheduling_config().await?;
        let now = self.now();
        let slot = config.slot_duration();

        let mut next = current.clone();

        let moved = current.barber_id != request.barber_id || current.start_time != request.start_time;
        if moved {
            if current.state.is_terminal() {
                return Err(RejectionReason::AlreadyTerminal.into());
            }

            let start = request.start_time;
            SlotValidator::validate(start, now, &config)?;
            self.ensure_user_with_role(request.barber_id, Role::Barber).await?;

            let schedule = self
                .availability_service
                .schedule_for(request.barber_id, start, start + slot)
                .await?;
            SlotValidator::validate_barber_schedule(start, &config, &schedule)?;

            if self
                .conflict_service
                .has_conflict(request.barber_id, start, start + slot, Some(id), slot)
                .await?
            {
                return Err(RejectionReason::SlotConflict.into());
            }

            next.barber_id = request.barber_id;
            next.start_time = start;
        }

        if let Some(new_state) = request.state.filter(|s| *s != current.state) {
            self.lifecycle_service.validate_manual_transition(current.state, new_state)?;
            next.state = new_state;
        }

        if next == current {
            debug!("Update of {} changes nothing", id);
            return Ok(current);
        }

        next.stamp(actor.audit(), now);
        let saved = self
            .stores
            .appointments
            .update(&next, current.state, slot)
            .await
            .map_err(commit_error)?;

        info!("Appointment {} updated by {} {}", id, actor.role, actor.id);
        if saved.state != current.state {
            self.notify(&saved, slot).await;
        }
        Ok(saved)
    }

    // ==============================================================================
    // STATE CHANGES
    // ==============================================================================

    /// Self-service cancellation by the client who owns the appointment.
    #[instrument(skip(self, note), fields(appointment_id = %id))]
    pub async fn cancel_own_appointment(
        &self,
        id: Uuid,
        client_id: Uuid,
        note: Option<String>,
    ) -> Result<Appointment, AppointmentError> {
        let current = self.fetch(id).await?;

        if current.client_id != client_id {
            return Err(AppointmentError::Forbidden(RejectionReason::NotOwner));
        }
        if current.state.is_terminal() {
            return Err(RejectionReason::AlreadyTerminal.into());
        }

        let config = self.scheduling_config().await?;
        let now = self.now();

        let note = truncate_note(note.as_deref());
        if note.is_some() && !config.cancellation_note_enabled {
            return Err(RejectionReason::NoteNotAllowed.into());
        }

        self.lifecycle_service
            .check_cancellation_window(current.start_time, now, &config)?;

        let by = AuditActor::User { id: client_id, role: Role::Client };
        let next = self.lifecycle_service.apply_manual(
            &current,
            AppointmentState::Cancelled,
            by,
            note.as_deref(),
            now,
        );

        let slot = config.slot_duration();
        let saved = self
            .stores
            .appointments
            .update(&next, current.state, slot)
            .await
            .map_err(commit_error)?;

        info!("Appointment {} cancelled by its client", id);
        self.notify(&saved, slot).await;
        Ok(saved)
    }

    #[instrument(skip(self, actor, note), fields(appointment_id = %id, new_state = %new_state))]
    pub async fn change_state(
        &self,
        id: Uuid,
        new_state: AppointmentState,
        actor: &Actor,
        note: Option<String>,
    ) -> Result<Appointment, AppointmentError> {
        let current = self.fetch(id).await?;
        self.lifecycle_service.authorize_staff(actor, &current)?;
        self.lifecycle_service.validate_manual_transition(current.state, new_state)?;

        let config = self.scheduling_config().await?;
        let now = self.now();
        let slot = config.slot_duration();

        let next = self
            .lifecycle_service
            .apply_manual(&current, new_state, actor.audit(), note.as_deref(), now);

        let saved = self
            .stores
            .appointments
            .update(&next, current.state, slot)
            .await
            .map_err(commit_error)?;

        info!("Appointment {} moved {} -> {} by {} {}", id, current.state, new_state, actor.role, actor.id);
        self.notify(&saved, slot).await;
        Ok(saved)
    }

    /// Physical removal, distinct from cancellation.
    #[instrument(skip(self, actor), fields(appointment_id = %id))]
    pub async fn delete_appointment(&self, id: Uuid, actor: &Actor) -> Result<(), AppointmentError> {
        let current = self.fetch(id).await?;
        self.lifecycle_service.authorize_staff(actor, &current)?;

        self.stores.appointments.delete(id).await?;
        info!("Appointment {} deleted by {} {}", id, actor.role, actor.id);
        Ok(())
    }

    // ==============================================================================
    // READS
    // ==============================================================================

    pub async fn get_appointment(&self, id: Uuid, actor: &Actor) -> Result<Appointment, AppointmentError> {
        self.sweep_before_read().await;

        let appointment = self.fetch(id).await?;
        if !self.lifecycle_service.can_view(actor, &appointment) {
            return Err(AppointmentError::Forbidden(RejectionReason::NotOwner));
        }
        Ok(appointment)
    }

    pub async fn list_appointments(&self, actor: &Actor) -> Result<Vec<Appointment>, AppointmentError> {
        self.sweep_before_read().await;

        let appointments = match actor.role {
            Role::Admin => self.stores.appointments.list_all().await?,
            Role::Barber => self.stores.appointments.list_all_for_barber(actor.id).await?,
            Role::Client => self.stores.appointments.list_for_client(actor.id).await?,
        };

        Ok(appointments)
    }

    /// Bookable slots of one barber on one day, in order. Every slot listed
    /// would pass the same checks as a booking made right now.
    #[instrument(skip(self))]
    pub async fn list_available_slots(
        &self,
        barber_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<AvailableSlot>, AppointmentError> {
        self.sweep_before_read().await;

        let config = self.scheduling_config().await?;
        self.ensure_user_with_role(barber_id, Role::Barber).await?;

        let slots = self.free_slots(barber_id, date, date, &config).await?;
        debug!("{} free slots for barber {} on {}", slots.len(), barber_id, date);
        Ok(slots)
    }

    /// Bookable slots over the inclusive day range `[from, to]`. The range
    /// may not reach past the configured booking horizon.
    #[instrument(skip(self))]
    pub async fn list_available_slots_range(
        &self,
        barber_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailableSlot>, AppointmentError> {
        if from > to || to.signed_duration_since(from).num_days() >= MAX_SLOT_RANGE_DAYS {
            return Err(RejectionReason::InvalidDateRange.into());
        }

        self.sweep_before_read().await;

        let config = self.scheduling_config().await?;
        if let Some(days) = config.max_advance_days {
            if to.and_time(NaiveTime::MIN) - self.now() > Duration::days(days as i64) {
                return Err(RejectionReason::BeyondMaxAdvance.into());
            }
        }
        self.ensure_user_with_role(barber_id, Role::Barber).await?;

        let slots = self.free_slots(barber_id, from, to, &config).await?;
        debug!("{} free slots for barber {} from {} to {}", slots.len(), barber_id, from, to);
        Ok(slots)
    }

    pub async fn list_occupied_ranges(
        &self,
        barber_id: Uuid,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<OccupiedRange>, AppointmentError> {
        self.sweep_before_read().await;

        let config = self.scheduling_config().await?;
        Ok(self
            .conflict_service
            .occupied_ranges(barber_id, from, to, config.slot_duration())
            .await?)
    }

    // ==============================================================================
    // SWEEP
    // ==============================================================================

    /// Moves every past Pending appointment to Expired and every past
    /// Confirmed one to Attended. Each row is committed on its own; a failed
    /// row is counted and skipped.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: NaiveDateTime) -> Result<SweepReport, AppointmentError> {
        let config = self.scheduling_config().await?;
        let slot = config.slot_duration();
        let stale = self.stores.appointments.list_stale(now).await?;

        let mut report = SweepReport::default();

        for appointment in stale {
            let Some(next_state) = self.lifecycle_service.automatic_transition(&appointment, now) else {
                continue;
            };
            let next = self.lifecycle_service.apply_automatic(&appointment, next_state, now);

            match self.stores.appointments.update(&next, appointment.state, slot).await {
                Ok(_) => match next_state {
                    AppointmentState::Expired => report.expired_count += 1,
                    _ => report.attended_count += 1,
                },
                Err(StoreError::StaleState { .. }) => {
                    debug!("Appointment {} changed during the sweep, skipping", appointment.id);
                }
                Err(e) => {
                    error!("Sweep failed for appointment {}: {}", appointment.id, e);
                    report.failed_count += 1;
                }
            }
        }

        if report.expired_count + report.attended_count > 0 {
            info!(
                "Sweep closed {} expired and {} attended appointments",
                report.expired_count, report.attended_count
            );
        }

        Ok(report)
    }

    /// Reads reflect current reality when possible, but never fail because of the sweep.
    async fn sweep_before_read(&self) {
        if let Err(e) = self.sweep_expired(self.now()).await {
            warn!("Best-effort sweep before read failed: {}", e);
        }
    }

    // ==============================================================================
    // PRIVATE HELPER METHODS
    // ==============================================================================

    /// One fetch of roster, blocks and bookings for the whole range, then
    /// every candidate start is filtered against them.
    async fn free_slots(
        &self,
        barber_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        config: &SchedulingConfig,
    ) -> Result<Vec<AvailableSlot>, AppointmentError> {
        let candidates: Vec<_> = from
            .iter_days()
            .take_while(|day| *day <= to)
            .flat_map(|day| candidate_starts(config, day))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.now();
        let slot = config.slot_duration();
        let range_start = from.and_time(NaiveTime::MIN);
        let range_end = to.and_time(NaiveTime::MIN) + Duration::days(1);

        let schedule = self
            .availability_service
            .schedule_for(barber_id, range_start, range_end)
            .await?;
        let booked = self
            .stores
            .appointments
            .list_for_barber(barber_id, range_start - slot, range_end)
            .await?;

        Ok(candidates
            .into_iter()
            .filter(|(_, start)| SlotValidator::validate_for_barber(*start, now, config, &schedule).is_ok())
            .filter(|(_, start)| find_conflicts(&booked, *start, *start + slot, None, slot).is_empty())
            .map(|(period, start)| AvailableSlot {
                start_time: start,
                end_time: start + slot,
                label: start.format("%H:%M").to_string(),
                period,
            })
            .collect())
    }

    async fn fetch(&self, id: Uuid) -> Result<Appointment, AppointmentError> {
        self.stores
            .appointments
            .get(id)
            .await?
            .ok_or(AppointmentError::NotFound(id))
    }

    async fn ensure_user_with_role(&self, id: Uuid, role: Role) -> Result<(), AppointmentError> {
        if self.stores.users.exists_with_role(id, role).await? {
            return Ok(());
        }

        let (not_found, invalid_role) = match role {
            Role::Barber => (RejectionReason::BarberNotFound, RejectionReason::BarberInvalidRole),
            Role::Client | Role::Admin => (RejectionReason::ClientNotFound, RejectionReason::ClientInvalidRole),
        };

        match self.stores.users.get_by_id(id).await? {
            Some(user) if user.active => {
                debug!("User {} is a {}, expected {}", id, user.role, role);
                Err(invalid_role.into())
            }
            _ => Err(not_found.into()),
        }
    }

    /// Queue a post-commit notification for confirmations and cancellations.
    async fn notify(&self, appointment: &Appointment, slot: Duration) {
        let Some(outbox) = &self.outbox else {
            return;
        };
        if !matches!(appointment.state, AppointmentState::Confirmed | AppointmentState::Cancelled) {
            return;
        }

        let client = self.stores.users.get_by_id(appointment.client_id).await;
        let barber = self.stores.users.get_by_id(appointment.barber_id).await;

        match (client, barber) {
            (Ok(Some(client)), Ok(Some(barber))) => outbox.publish(StateChangeNotification {
                appointment_id: appointment.id,
                client_name: client.name,
                client_email: client.email,
                barber_name: barber.name,
                slot_start: appointment.start_time,
                slot_end: appointment.end_time(slot),
                new_state: appointment.state,
                note: appointment.note.clone(),
            }),
            _ => warn!("Could not resolve contacts for appointment {}, notification skipped", appointment.id),
        }
    }
}

fn commit_error(err: StoreError) -> AppointmentError {
    match &err {
        StoreError::Conflict { barber_id, start_time } => {
            warn!("Concurrent booking for barber {} at {} lost at commit", barber_id, start_time);
        }
        StoreError::QuotaExceeded { client_id, max } => {
            warn!("Concurrent booking pushed client {} past {} active appointments", client_id, max);
        }
        StoreError::StaleState { id, expected } => {
            warn!("Appointment {} left state {} before the write", id, expected);
        }
        _ => {}
    }
    err.into()
}
