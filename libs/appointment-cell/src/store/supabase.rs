// libs/appointment-cell/src/store/supabase.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::{DatabaseError, SupabaseClient};
use shared_models::auth::Role;

use crate::models::{
    Appointment, AppointmentState, AuditActor, BarberAvailability, DirectoryUser, ScheduleBlock,
};
use crate::store::{
    AppointmentStore, AvailabilityStore, ConfigStore, StoreError, UserDirectory,
};

const SYSTEM_ROLE: &str = "system";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const QUOTA_EXCEEDED_MARKER: &str = "QUOTA_EXCEEDED";

/// PostgREST-backed store.
///
/// Double booking is prevented at commit time by the partial unique index
/// `appointments (barber_id, start_time) WHERE state IN (1, 2)`; PostgREST
/// reports its violation as HTTP 409.
pub struct SupabaseStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseStore {
    pub fn new(config: &AppConfig) -> Self {
        Self { supabase: Arc::new(SupabaseClient::new(config)) }
    }

    pub fn with_client(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn fetch_appointments(&self, query: &str) -> Result<Vec<Appointment>, StoreError> {
        let path = format!("/rest/v1/appointments?{}", query);
        let rows: Vec<AppointmentRow> = self
            .supabase
            .request(Method::GET, &path, None)
            .await
            .map_err(backend_error)?;

        rows.into_iter().map(AppointmentRow::into_appointment).collect()
    }
}

// ==============================================================================
// ROW MAPPING
// ==============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct AppointmentRow {
    id: Uuid,
    client_id: Uuid,
    barber_id: Uuid,
    start_time: NaiveDateTime,
    state: i16,
    note: Option<String>,
    modified_by_id: Option<Uuid>,
    modified_by_role: Option<String>,
    modified_at: Option<NaiveDateTime>,
    created_at: NaiveDateTime,
}

impl AppointmentRow {
    fn from_appointment(appointment: &Appointment) -> Self {
        let (modified_by_id, modified_by_role) = match appointment.modified_by {
            Some(AuditActor::System) => (None, Some(SYSTEM_ROLE.to_string())),
            Some(AuditActor::User { id, role }) => (Some(id), Some(role.as_str().to_string())),
            None => (None, None),
        };

        Self {
            id: appointment.id,
            client_id: appointment.client_id,
            barber_id: appointment.barber_id,
            start_time: appointment.start_time,
            state: appointment.state.id(),
            note: appointment.note.clone(),
            modified_by_id,
            modified_by_role,
            modified_at: appointment.modified_at,
            created_at: appointment.created_at,
        }
    }

    fn into_appointment(self) -> Result<Appointment, StoreError> {
        let state = AppointmentState::from_id(self.state).ok_or_else(|| {
            StoreError::Backend(format!("Unknown state {} on appointment {}", self.state, self.id))
        })?;

        let modified_by = match (self.modified_by_role.as_deref(), self.modified_by_id) {
            (Some(SYSTEM_ROLE), _) => Some(AuditActor::System),
            (Some(role), Some(id)) => role.parse::<Role>().ok().map(|role| AuditActor::User { id, role }),
            _ => None,
        };

        Ok(Appointment {
            id: self.id,
            client_id: self.client_id,
            barber_id: self.barber_id,
            start_time: self.start_time,
            state,
            note: self.note,
            modified_by,
            modified_at: self.modified_at,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SettingRow {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct UserRow {
    id: Uuid,
    name: Option<String>,
    email: Option<String>,
    role: String,
    active: Option<bool>,
}

fn backend_error(err: DatabaseError) -> StoreError {
    error!("Supabase request failed: {}", err);
    StoreError::Backend(err.to_string())
}

/// Raised by the quota trigger; PostgREST reports it as 400 with the
/// exception message in the body.
fn is_quota_violation(err: &DatabaseError) -> bool {
    match err {
        DatabaseError::Api { body, .. } | DatabaseError::Conflict(body) => body.contains(QUOTA_EXCEEDED_MARKER),
        _ => false,
    }
}

fn ts(value: NaiveDateTime) -> String {
    urlencoding::encode(&value.format(TIMESTAMP_FORMAT).to_string()).into_owned()
}

fn active_states() -> String {
    format!("in.({},{})", AppointmentState::Pending.id(), AppointmentState::Confirmed.id())
}

// ==============================================================================
// TRAIT IMPLEMENTATIONS
// ==============================================================================

#[async_trait]
impl AppointmentStore for SupabaseStore {
    async fn get(&self, id: Uuid) -> Result<Option<Appointment>, StoreError> {
        let mut found = self.fetch_appointments(&format!("id=eq.{}", id)).await?;
        Ok(found.pop())
    }

    /// The quota is enforced by the `appointments_client_quota` trigger, which
    /// reads `MAX_ACTIVE_APPOINTMENTS_PER_CLIENT` and raises `QUOTA_EXCEEDED`.
    async fn insert(
        &self,
        appointment: &Appointment,
        _slot: Duration,
        max_active_per_client: u32,
    ) -> Result<Appointment, StoreError> {
        debug!("Inserting appointment {} for barber {}", appointment.id, appointment.barber_id);

        let body = serde_json::to_value(AppointmentRow::from_appointment(appointment))
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows: Vec<AppointmentRow> = self
            .supabase
            .request_with_headers(
                Method::POST,
                "/rest/v1/appointments",
                Some(body),
                Some(SupabaseClient::return_representation()),
            )
            .await
            .map_err(|e| match e {
                e if is_quota_violation(&e) => StoreError::QuotaExceeded {
                    client_id: appointment.client_id,
                    max: max_active_per_client,
                },
                DatabaseError::Conflict(_) => StoreError::Conflict {
                    barber_id: appointment.barber_id,
                    start_time: appointment.start_time,
                },
                other => backend_error(other),
            })?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend("Insert returned no rows".to_string()))?
            .into_appointment()
    }

    async fn update(
        &self,
        appointment: &Appointment,
        expected_state: AppointmentState,
        _slot: Duration,
    ) -> Result<Appointment, StoreError> {
        let path = format!(
            "/rest/v1/appointments?id=eq.{}&state=eq.{}",
            appointment.id,
            expected_state.id()
        );
        let body = serde_json::to_value(AppointmentRow::from_appointment(appointment))
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows: Vec<AppointmentRow> = self
            .supabase
            .request_with_headers(Method::PATCH, &path, Some(body), Some(SupabaseClient::return_representation()))
            .await
            .map_err(|e| match e {
                DatabaseError::Conflict(_) => StoreError::Conflict {
                    barber_id: appointment.barber_id,
                    start_time: appointment.start_time,
                },
                other => backend_error(other),
            })?;

        match rows.into_iter().next() {
            Some(row) => row.into_appointment(),
            // Nothing matched: either the row is gone or its state moved on.
            None => match self.get(appointment.id).await? {
                Some(_) => {
                    warn!("Conditional update of {} lost a race (expected {})", appointment.id, expected_state);
                    Err(StoreError::StaleState { id: appointment.id, expected: expected_state })
                }
                None => Err(StoreError::NotFound(appointment.id)),
            },
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let path = format!("/rest/v1/appointments?id=eq.{}", id);
        let deleted: Vec<Value> = self
            .supabase
            .request_with_headers(Method::DELETE, &path, None, Some(SupabaseClient::return_representation()))
            .await
            .map_err(backend_error)?;

        if deleted.is_empty() {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn list_for_barber(
        &self,
        barber_id: Uuid,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.fetch_appointments(&format!(
            "barber_id=eq.{}&start_time=gte.{}&start_time=lt.{}&order=start_time.asc",
            barber_id,
            ts(from),
            ts(to)
        ))
        .await
    }

    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        self.fetch_appointments(&format!("client_id=eq.{}&order=start_time.asc", client_id))
            .await
    }

    async fn list_all_for_barber(&self, barber_id: Uuid) -> Result<Vec<Appointment>, StoreError> {
        self.fetch_appointments(&format!("barber_id=eq.{}&order=start_time.asc", barber_id))
            .await
    }

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError> {
        self.fetch_appointments("order=start_time.asc").await
    }

    async fn list_stale(&self, now: NaiveDateTime) -> Result<Vec<Appointment>, StoreError> {
        self.fetch_appointments(&format!(
            "state={}&start_time=lt.{}&order=start_time.asc",
            active_states(),
            ts(now)
        ))
        .await
    }

    async fn count_active_for_client(&self, client_id: Uuid) -> Result<usize, StoreError> {
        let path = format!(
            "/rest/v1/appointments?client_id=eq.{}&state={}&select=id",
            client_id,
            active_states()
        );
        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, None)
            .await
            .map_err(backend_error)?;
        Ok(rows.len())
    }
}

#[async_trait]
impl ConfigStore for SupabaseStore {
    async fn get_values(&self, keys: &[&str]) -> Result<HashMap<String, String>, StoreError> {
        let path = format!("/rest/v1/system_settings?key=in.({})&select=key,value", keys.join(","));
        let rows: Vec<SettingRow> = self
            .supabase
            .request(Method::GET, &path, None)
            .await
            .map_err(backend_error)?;

        Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
    }
}

#[async_trait]
impl UserDirectory for SupabaseStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<DirectoryUser>, StoreError> {
        let path = format!("/rest/v1/users?id=eq.{}&select=id,name,email,role,active", id);
        let rows: Vec<UserRow> = self
            .supabase
            .request(Method::GET, &path, None)
            .await
            .map_err(backend_error)?;

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        match row.role.parse::<Role>() {
            Ok(role) => Ok(Some(DirectoryUser {
                id: row.id,
                name: row.name.unwrap_or_default(),
                email: row.email,
                role,
                active: row.active.unwrap_or(true),
            })),
            Err(e) => {
                warn!("User {} has an unusable role: {}", row.id, e);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl AvailabilityStore for SupabaseStore {
    async fn windows_for_barber(&self, barber_id: Uuid) -> Result<Vec<BarberAvailability>, StoreError> {
        let path = format!("/rest/v1/barber_availability?barber_id=eq.{}&order=weekday.asc", barber_id);
        self.supabase
            .request(Method::GET, &path, None)
            .await
            .map_err(backend_error)
    }

    async fn blocks_for_barber(
        &self,
        barber_id: Uuid,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<ScheduleBlock>, StoreError> {
        let path = format!(
            "/rest/v1/schedule_blocks?barber_id=eq.{}&start_time=lt.{}&end_time=gt.{}",
            barber_id,
            ts(to),
            ts(from)
        );
        self.supabase
            .request(Method::GET, &path, None)
            .await
            .map_err(backend_error)
    }
}
