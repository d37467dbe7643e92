use axum::{
    Router,
    routing::get,
};

use appointment_cell::{appointment_routes, AppointmentCellState};

pub fn create_router(state: AppointmentCellState) -> Router {
    Router::new()
        .route("/", get(|| async { "Barbershop API is running!" }))
        .nest("/appointments", appointment_routes(state))
}
