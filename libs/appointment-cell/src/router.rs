// libs/appointment-cell/src/router.rs
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
    middleware,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::services::booking::AppointmentBookingService;

#[derive(Clone)]
pub struct AppointmentCellState {
    pub config: Arc<AppConfig>,
    pub booking: Arc<AppointmentBookingService>,
}

pub fn appointment_routes(state: AppointmentCellState) -> Router {
    let protected_routes = Router::new()
        .route("/", post(handlers::create_appointment).get(handlers::list_appointments))
        .route("/sweep", post(handlers::sweep_appointments)) // Admin only
        .route(
            "/{appointment_id}",
            get(handlers::get_appointment)
                .put(handlers::update_appointment)
                .delete(handlers::delete_appointment),
        )
        .route("/{appointment_id}/state", post(handlers::change_appointment_state))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    // Booking widgets read these before the user signs in
    let public_routes = Router::new()
        .route("/slots", get(handlers::get_available_slots))
        .route("/slots/range", get(handlers::get_available_slots_range))
        .route("/occupied", get(handlers::get_occupied_ranges));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
