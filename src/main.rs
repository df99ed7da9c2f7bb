use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vestibule::config::GatewayConfig;
use vestibule::db::pool::{create_pool, run_migrations};
use vestibule::push::{FcmPush, NoopPush, PushNotifier};
use vestibule::session::history::HistoryStore;
use vestibule::session::registry::SessionRegistry;
use vestibule::web::app_state::AppState;
use vestibule::web::router::build_router;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::load("vestibule.toml");

    let pool = create_pool(&config.database.url)
        .await
        .expect("failed to connect to database");
    run_migrations(&pool)
        .await
        .expect("failed to run database migrations");

    let history = Arc::new(HistoryStore::new(chrono::Duration::hours(
        config.history.retention_hours,
    )));

    let push: Arc<dyn PushNotifier> = match config.push.credentials_file.as_deref() {
        Some(path) => match FcmPush::from_credentials_file(Path::new(path)) {
            Ok(fcm) => Arc::new(fcm),
            Err(e) => {
                warn!(error = %e, "push credentials unusable, notifications disabled");
                Arc::new(NoopPush)
            }
        },
        None => Arc::new(NoopPush),
    };

    let listen_addr = config.server.listen_addr.clone();
    let state = Arc::new(AppState {
        registry: SessionRegistry::new(),
        history,
        db: pool,
        push,
        config,
    });

    let app = build_router(state);

    info!("vestibule gateway listening on {}", listen_addr);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .expect("failed to bind listener");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}
