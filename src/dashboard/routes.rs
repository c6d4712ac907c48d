//! Dashboard REST/websocket handlers.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use serde::Serialize;
use tokio::time::interval;
use tracing::warn;

use crate::dashboard::AppState;
use crate::exchange::MarketEvent;
use crate::ledger::{DashboardUpdate, EquitySample, LivePerformance, Performance};
use crate::models::TraderSnapshot;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub balance: rust_decimal::Decimal,
    pub equity: rust_decimal::Decimal,
    pub peak_equity: rust_decimal::Decimal,
    pub pnl_today: rust_decimal::Decimal,
    pub active_traders: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (balance, equity, peak_equity, pnl_today) = state.ledger.get_status();
    Json(StatusResponse {
        balance,
        equity,
        peak_equity,
        pnl_today,
        active_traders: state.supervisor.active_trader_count().await,
    })
}

pub async fn get_traders(State(state): State<AppState>) -> Json<Vec<TraderSnapshot>> {
    Json(state.ledger.get_traders())
}

pub async fn get_trader(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TraderSnapshot>, StatusCode> {
    state
        .ledger
        .get_trader(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
pub struct PerformanceResponse {
    #[serde(flatten)]
    pub performance: Performance,
    #[serde(flatten)]
    pub live: LivePerformance,
}

pub async fn get_performance(State(state): State<AppState>) -> Json<PerformanceResponse> {
    Json(PerformanceResponse {
        performance: state.ledger.get_performance(),
        live: state.ledger.get_live_performance(),
    })
}

pub async fn get_history(State(state): State<AppState>) -> Json<Vec<EquitySample>> {
    Json(state.ledger.equity_series())
}

#[derive(Debug, Serialize)]
pub struct TopGainer {
    pub id: String,
    pub symbol: String,
    pub total_pnl: rust_decimal::Decimal,
}

/// Active traders ranked by `realizedPnl + unrealizedPnl` descending.
pub async fn get_top_gainers(State(state): State<AppState>) -> Json<Vec<TopGainer>> {
    let mut gainers: Vec<TopGainer> = state
        .ledger
        .get_traders()
        .into_iter()
        .map(|t| TopGainer {
            id: t.id,
            symbol: t.symbol,
            total_pnl: t.realized_pnl + t.unrealized_pnl,
        })
        .collect();
    gainers.sort_by(|a, b| b.total_pnl.cmp(&a.total_pnl));
    gainers.truncate(10);
    Json(gainers)
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum WsServerEvent {
    #[serde(rename = "dashboardUpdate")]
    DashboardUpdate(DashboardUpdate),
    #[serde(rename = "priceUpdate")]
    PriceUpdate { symbol: String, mid: rust_decimal::Decimal },
}

/// Ticks `dashboardUpdate` every 2s and forwards `priceUpdate` for every
/// `bookTicker` observed on the Adapter's event stream.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut ticker = interval(std::time::Duration::from_secs(2));
    let mut events = state.adapter.subscribe_events();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let update = WsServerEvent::DashboardUpdate(state.ledger.get_dashboard_update());
                let msg = serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_string());
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(MarketEvent::BookTicker { symbol, bid, ask }) => {
                        let mid = (bid + ask) / rust_decimal::Decimal::TWO;
                        let update = WsServerEvent::PriceUpdate { symbol, mid };
                        let msg = serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_string());
                        if socket.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "dashboard websocket event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
