use binmatrix::orchestration::spawn_overflow_sweeper;
use binmatrix::{api, config::Config, db::init_db, Journal, MatrixService, Repository};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let port = config.port;

    // Initialize database and restore the matrix from it
    let pool = match init_db(&config.database_path).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let journal: Arc<dyn Journal> = Arc::new(Repository::new(pool));
    let service = match MatrixService::open(
        config.engine.clone(),
        journal,
        config.contention_budget,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to restore matrix: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(every) = config.overflow_sweep {
        spawn_overflow_sweeper(service.clone(), every);
    }

    tracing::info!(
        policy = %config.engine.policy,
        max_search_depth = config.engine.max_search_depth,
        "Matrix engine ready"
    );

    // Create router
    let app = api::create_router(api::AppState::new(service, config));

    // Bind to address
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on {}", addr);

    // Run server
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
