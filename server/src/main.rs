use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use matchday_server::config::{Config, StorageBackend};
use matchday_server::gateways::{
    AfricasTalkingSms, LoggingSms, MpesaClient, PaymentGateway, SmsSender,
};
use matchday_server::routes::create_routes;
use matchday_server::state::AppState;
use matchday_server::store::{MemoryStore, PgStore, Store};

const DB_MAX_CONNECTIONS: u32 = 5;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn Store> = match config.storage {
        StorageBackend::Postgres => {
            let pg = PgStore::connect(&config.database_url, DB_MAX_CONNECTIONS).await?;
            tracing::info!("Successfully connected to database");
            pg.migrate().await?;
            tracing::info!("Migrations run successfully");
            Arc::new(pg)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    if config.mpesa.consumer_key.is_empty() || config.mpesa.consumer_secret.is_empty() {
        tracing::warn!("M-Pesa credentials are not set; STK pushes will fail");
    }
    let gateway: Arc<dyn PaymentGateway> = Arc::new(MpesaClient::new(config.mpesa.clone())?);

    let sms: Arc<dyn SmsSender> = match &config.sms.api_key {
        Some(key) => Arc::new(AfricasTalkingSms::new(&config.sms, key.clone())?),
        None => {
            tracing::warn!("SMS_API_KEY not set; confirmations are only logged");
            Arc::new(LoggingSms::default())
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config, store, gateway, sms);
    let sweeper = tokio::spawn(state.sweeper().run());
    let app = create_routes(state);

    tracing::info!("Server running at http://{}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    Ok(())
}
