use crate::{
    notification::{
        notification_dto::HealthResponse,
        notification_handlers,
        notification_models::{NewNotification, Notification, NotificationState},
        routes::notification_routes,
    },
    state::AppState,
    websocket::ws_handler,
};
use axum::{routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        notification_handlers::health,
        notification_handlers::create_notification,
        notification_handlers::list_notifications,
    ),
    components(
        schemas(
            HealthResponse,
            NewNotification,
            Notification,
            NotificationState,
        )
    ),
    tags(
        (name = "health", description = "Service status"),
        (name = "notifications", description = "Notification endpoints")
    )
)]
struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(notification_handlers::health))
        .route("/ws/notifications/:user_id", get(ws_handler))
        .nest("/api", notification_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
