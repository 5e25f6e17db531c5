use axum::{routing::{get, post}, Router};

use super::notification_handlers;
use crate::state::AppState;

pub fn notification_routes() -> Router<AppState> {
    Router::new()
        .route("/notifications", post(notification_handlers::create_notification))
        .route(
            "/users/:user_id/notifications",
            get(notification_handlers::list_notifications),
        )
}
