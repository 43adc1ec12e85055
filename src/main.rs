use axum::serve;
use dt_asset_db::api::handlers::ApiContext;
use dt_asset_db::api::routes::create_router;
use dt_asset_db::config::AppConfig;
use dt_asset_db::store::PostgresStore;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .init();

    println!("DT Asset DB: Digital-Thread Asset Document Server");

    // Load configuration
    let config = AppConfig::load()?;
    println!(
        "Configuration loaded: server={}:{}",
        config.server.host, config.server.port
    );

    println!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let postgres_store = PostgresStore::new(&database_url).await?;

    println!("Running database migrations...");
    postgres_store.migrate().await?;
    println!("Database ready");

    let state = Arc::new(ApiContext::new(postgres_store, config.addressing.clone()));

    run_server(create_router().with_state(state), &config).await?;

    Ok(())
}

async fn run_server(app: axum::Router, config: &AppConfig) -> anyhow::Result<()> {
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    println!("DT Asset DB server running on http://{}", bind_address);

    serve(listener, app).await?;

    Ok(())
}
