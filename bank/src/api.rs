//! Ambient HTTP surface (C13): health/readiness/metrics plus thin
//! pass-through handlers over the core library. Authentication, request
//! framing, and body deserialization beyond simple JSON extraction are out
//! of scope (§6) — handlers are a deserialize-call-serialize shim, not a
//! place where business rules live.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::accounts::{self, AccountError, NewCustomer};
use crate::amount::Amount;
use crate::config::Config;
use crate::metrics::{self, Metrics};
use crate::notify::NotifyBus;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub notify: Arc<NotifyBus>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn liveness() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, "ready").into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database unreachable").into_response(),
    }
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    if let Err(e) = metrics::refresh_gauges(&state.metrics, &state.pool).await {
        tracing::warn!(error = %e, "failed to refresh metric gauges");
    }
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response();
    }
    ([("content-type", encoder.format_type())], buffer).into_response()
}

#[derive(Deserialize)]
struct CreateAccountRequest {
    login: String,
    password_hash: String,
    name: String,
    email: Option<String>,
    phone: Option<String>,
    cashout_payto: Option<String>,
    tan_channel: Option<String>,
}

#[derive(Serialize)]
struct CreateAccountResponse {
    customer_id: i64,
    account_id: i64,
}

async fn create_account(
    State(state): State<AppState>,
    Json(body): Json<CreateAccountRequest>,
) -> Response {
    let max_debt = Amount::new(
        state.config.accounts.default_max_debt_val,
        state.config.accounts.default_max_debt_frac,
    )
    .unwrap_or(Amount::ZERO);

    let result = accounts::create_customer(
        &state.pool,
        NewCustomer {
            login: &body.login,
            password_hash: &body.password_hash,
            name: &body.name,
            email: body.email.as_deref(),
            phone: body.phone.as_deref(),
            cashout_payto: body.cashout_payto.as_deref(),
            tan_channel: body.tan_channel.as_deref(),
            max_debt,
        },
    )
    .await;

    match result {
        Ok((customer_id, account_id)) => {
            (StatusCode::CREATED, Json(CreateAccountResponse { customer_id, account_id }))
                .into_response()
        }
        Err(e) => account_error_response(e),
    }
}

#[derive(Serialize)]
struct AccountSummary {
    id: i64,
    payto: String,
    is_public: bool,
    balance: String,
    has_debt: bool,
}

async fn get_account(State(state): State<AppState>, Path(login): Path<String>) -> Response {
    match accounts::get_account_by_login(&state.pool, &login).await {
        Ok(row) => {
            let balance = Amount::new(row.balance_val as u64, row.balance_frac as u32)
                .unwrap_or(Amount::ZERO);
            Json(AccountSummary {
                id: row.id,
                payto: row.payto,
                is_public: row.is_public,
                balance: balance.to_decimal_string(),
                has_debt: row.has_debt,
            })
            .into_response()
        }
        Err(e) => account_error_response(e),
    }
}

async fn list_public_accounts(State(state): State<AppState>) -> Response {
    match accounts::list_public_accounts(&state.pool, 100).await {
        Ok(rows) => {
            let summaries: Vec<AccountSummary> = rows
                .into_iter()
                .map(|row| {
                    let balance = Amount::new(row.balance_val as u64, row.balance_frac as u32)
                        .unwrap_or(Amount::ZERO);
                    AccountSummary {
                        id: row.id,
                        payto: row.payto,
                        is_public: row.is_public,
                        balance: balance.to_decimal_string(),
                        has_debt: row.has_debt,
                    }
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => account_error_response(e),
    }
}

fn account_error_response(e: AccountError) -> Response {
    let status = match e {
        AccountError::LoginReuse | AccountError::PayToReuse => StatusCode::CONFLICT,
        AccountError::UnknownAccount => StatusCode::NOT_FOUND,
        AccountError::BalanceNotZero
        | AccountError::TanRequired
        | AccountError::NonAdminDebtLimit
        | AccountError::NonAdminCashout => StatusCode::CONFLICT,
        AccountError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route("/accounts", post(create_account).get(list_public_accounts))
        .route("/accounts/{login}", get(get_account))
        .with_state(state)
}

pub async fn start_server(bind_address: &str, state: AppState) -> eyre::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    tracing::info!(bind_address, "ambient HTTP surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}
