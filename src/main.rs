use hackathon_notifications::{
    db::{create_pool, run_migrations},
    notification::{InMemoryBackend, NotificationBackend, PgNotificationRepository},
    routes::create_router,
    state::{AppState, Config},
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hackathon_notifications=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);

    let backend: Arc<dyn NotificationBackend> = match config.database_url.as_deref() {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let db = create_pool(database_url, config.database_max_connections).await?;

            tracing::info!("Running migrations...");
            run_migrations(&db).await?;

            Arc::new(PgNotificationRepository::new(db))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, notifications are kept in memory");
            Arc::new(InMemoryBackend::new())
        }
    };

    let state = AppState::new(config.clone(), backend);
    let app = create_router(state);

    let addr = config.addr();
    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
