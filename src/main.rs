use std::{net::Ipv4Addr, sync::Arc};

use tracing::info;
use tracing_subscriber::EnvFilter;

use todo_api::{config::Config, create_app, db, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("todo_api=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().expect("valid configuration");

    let db = db::init_db(&config.db).expect("initializing database");
    db.ping().await.expect("database to answer a ping");
    info!(
        dsn = %config.db.dsn,
        max_open_conns = config.db.max_open_conns,
        "database connection pool established"
    );

    let state = AppState {
        db,
        env: Arc::new(config.env.clone()),
    };
    let app = create_app(state);
    let addr = (Ipv4Addr::UNSPECIFIED, config.port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("binding the listen port");

    info!(env = %config.env, "running on {addr:?}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("failed serving");

    info!("server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing the Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing the SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
