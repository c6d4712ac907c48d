//! Entrypoint: loads `EngineConfig`, wires up the selected Exchange Adapter,
//! starts the Supervisor, and serves the dashboard.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tradehand_backend::config::{EngineConfig, RunMode};
use tradehand_backend::dashboard::{self, AppState};
use tradehand_backend::exchange::live::LiveExchangeAdapter;
use tradehand_backend::exchange::market_data::MarketDataClient;
use tradehand_backend::exchange::simulator::SimulatorExchangeAdapter;
use tradehand_backend::exchange::ExchangeAdapter;
use tradehand_backend::ledger::Ledger;
use tradehand_backend::supervisor::Supervisor;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradehand_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = EngineConfig::from_env();
    info!(mode = ?config.mode, max_traders = config.max_traders, "starting trading engine");

    let starting_balance =
        Decimal::try_from(config.starting_balance_usdt).context("invalid STARTING_BALANCE_USDT")?;
    let ledger = Ledger::new(starting_balance);

    let adapter: Arc<dyn ExchangeAdapter> = match config.mode {
        RunMode::Live => LiveExchangeAdapter::new(
            config.base_rest_url.clone(),
            config.base_ws_url.clone(),
            config.api_key.clone(),
            config.api_secret.clone(),
            config.recv_window_ms,
        ),
        RunMode::Test => SimulatorExchangeAdapter::new(
            Arc::new(MarketDataClient::new(config.base_rest_url.clone())),
            starting_balance,
            config.fee_rate,
            config.slippage_rate,
        ),
    };

    let supervisor = Supervisor::new(config.clone(), Arc::clone(&adapter), Arc::clone(&ledger));
    supervisor
        .run()
        .await
        .context("supervisor failed to start")?;

    let app_state = AppState {
        ledger: Arc::clone(&ledger),
        adapter: Arc::clone(&adapter),
        supervisor: Arc::clone(&supervisor),
    };
    let app = dashboard::router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.dashboard_port));
    let listener = TcpListener::bind(addr).await.context("dashboard port bind failed")?;
    info!(%addr, "dashboard listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("dashboard server error")?;

    Ok(())
}
