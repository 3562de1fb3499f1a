//! The HTTP façade.
//!
//! Thin handlers translating requests into wallet operations. Every
//! response is the `{Code, Msg, Data}` envelope with `Code` 0 on
//! success; invalid arguments answer 400, operational failures 500,
//! with the HTTP status mirrored in `Code`.

use std::sync::Arc;

use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::*;

use crate::{error::WalletError, wallet::Wallet};

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<T: Serialize> {
    code: i32,
    msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        code: 0,
        msg: "success".to_string(),
        data: Some(data),
    })
    .into_response()
}

fn fail(status: StatusCode, msg: impl Into<String>) -> Response {
    let msg = msg.into();
    (
        status,
        Json(Envelope::<()> {
            code: status.as_u16() as i32,
            msg,
            data: None,
        }),
    )
        .into_response()
}

fn error_response(err: WalletError) -> Response {
    let status = match err {
        WalletError::InvalidAddress(_)
        | WalletError::Decode(_)
        | WalletError::UnknownChain(_)
        | WalletError::OmniUnsupportedOnChain(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(%err, "request failed");
    fail(status, err.to_string())
}

/// Builds the service router.
pub fn router(wallet: Arc<Wallet>) -> Router {
    Router::new()
        .route("/getAddress", get(get_address))
        .route("/getBalance", get(get_balance))
        .route("/getInnerBalance", get(get_inner_balance))
        .route("/sendCoin", post(send_coin))
        .route("/sendSignedTx", post(send_signed_tx))
        .route("/prepareTrezorSign", post(prepare_trezor_sign))
        .route("/sendOmniCoin", post(send_omni_coin))
        .route("/prepareOmniTrezorSign", post(prepare_omni_trezor_sign))
        .route("/getOmniBalance", get(get_omni_balance))
        .route("/dumpUtxo", get(dump_utxo))
        .fallback(not_found)
        .with_state(wallet)
}

async fn not_found() -> Response {
    fail(StatusCode::NOT_FOUND, "Not found")
}

async fn get_address(State(wallet): State<Arc<Wallet>>) -> Response {
    match wallet.issue_deposit_address().await {
        Ok(addr) => ok(addr),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct BalanceQuery {
    address: Option<String>,
}

async fn get_balance(
    State(wallet): State<Arc<Wallet>>,
    Query(query): Query<BalanceQuery>,
) -> Response {
    let address = query.address.as_deref().filter(|a| !a.is_empty());
    match wallet.balance_decimal(address) {
        Ok(balance) => ok(json!({ "balance": balance })),
        Err(err) => error_response(err),
    }
}

async fn get_inner_balance(State(wallet): State<Arc<Wallet>>) -> Response {
    match wallet.inner_balance_decimal() {
        Ok(balance) => ok(json!({ "balance": balance })),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct SendCoinForm {
    to: Option<String>,
    amount: Option<String>,
}

async fn send_coin(
    State(wallet): State<Arc<Wallet>>,
    Form(form): Form<SendCoinForm>,
) -> Response {
    let Some(to) = form.to.filter(|t| !t.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing to field");
    };
    let Some(amount) = form.amount.filter(|a| !a.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing amount field");
    };
    match wallet.send_coin(&to, &amount).await {
        Ok(txhash) => ok(json!({ "txhash": txhash })),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct SendSignedForm {
    hex: Option<String>,
}

async fn send_signed_tx(
    State(wallet): State<Arc<Wallet>>,
    Form(form): Form<SendSignedForm>,
) -> Response {
    let Some(hex) = form.hex.filter(|h| !h.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing hex field");
    };
    match wallet.send_signed(&hex).await {
        Ok(hash) => ok(json!({ "hash": hash })),
        Err(err) => error_response(err),
    }
}

async fn prepare_trezor_sign(
    State(wallet): State<Arc<Wallet>>,
    Form(form): Form<SendCoinForm>,
) -> Response {
    let Some(to) = form.to.filter(|t| !t.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing to field");
    };
    let amount = form.amount.filter(|a| !a.is_empty());
    match wallet.prepare_trezor(&to, amount.as_deref()).await {
        Ok(payload) => ok(json!({ "trezorTx": payload })),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct OmniSendForm {
    token: Option<String>,
    from: Option<String>,
    to: Option<String>,
    amount: Option<String>,
}

async fn send_omni_coin(
    State(wallet): State<Arc<Wallet>>,
    Form(form): Form<OmniSendForm>,
) -> Response {
    let Some(to) = form.to.filter(|t| !t.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing to field");
    };
    let Some(amount) = form.amount.filter(|a| !a.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing amount field");
    };
    let token = form.token.unwrap_or_default();
    match wallet
        .send_omni(&token, form.from.as_deref(), &to, &amount)
        .await
    {
        Ok(txhash) => ok(json!({ "txhash": txhash })),
        Err(err) => error_response(err),
    }
}

async fn prepare_omni_trezor_sign(
    State(wallet): State<Arc<Wallet>>,
    Form(form): Form<OmniSendForm>,
) -> Response {
    let Some(from) = form.from.filter(|f| !f.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing from field");
    };
    let Some(amount) = form.amount.filter(|a| !a.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing amount field");
    };
    let token = form.token.unwrap_or_default();
    match wallet
        .prepare_omni_trezor(&token, &from, form.to.as_deref(), &amount)
        .await
    {
        Ok(payload) => ok(json!({ "trezorTx": payload })),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct OmniBalanceQuery {
    address: Option<String>,
    token: Option<String>,
}

async fn get_omni_balance(
    State(wallet): State<Arc<Wallet>>,
    Query(query): Query<OmniBalanceQuery>,
) -> Response {
    let Some(address) = query.address.filter(|a| !a.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "Missing address field");
    };
    let token = query.token.unwrap_or_default();
    match wallet.omni_balance_decimal(&address, &token).await {
        Ok(balance) => ok(json!({ "balance": balance })),
        Err(err) => error_response(err),
    }
}

async fn dump_utxo(State(wallet): State<Arc<Wallet>>) -> Response {
    match wallet.dump_utxos() {
        Ok(count) => {
            info!(count, "utxo dump complete");
            ok("Done")
        }
        Err(err) => error_response(err),
    }
}
