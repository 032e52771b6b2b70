use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::{self, CandidateView, PlaceOrderRequest};
use crate::error::AppError;
use crate::gate::{self, VerifyOutcome};
use crate::models::order::{Order, ShopOrder, ShopOrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(place_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/payment/verify", post(verify_payment))
        .route("/orders/:id/status", post(update_status))
        .route(
            "/orders/:order_id/shop-orders/:shop_order_id/otp",
            post(issue_otp),
        )
        .route(
            "/orders/:order_id/shop-orders/:shop_order_id/otp/verify",
            post(verify_otp),
        )
}

async fn place_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PlaceOrderRequest>,
) -> Result<Json<Order>, AppError> {
    let order = dispatch::place_order(&state, payload)?;
    Ok(Json(order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    state
        .ledger
        .get(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("order {id} not found")))
}

async fn verify_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = dispatch::verify_payment(&state, id)?;
    Ok(Json(order))
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub shop_id: Uuid,
    pub status: ShopOrderStatus,
}

#[derive(Serialize)]
pub struct UpdateStatusResponse {
    pub shop_order: ShopOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_agents: Option<Vec<CandidateView>>,
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<UpdateStatusResponse>, AppError> {
    let result = dispatch::update_status(&state, id, payload.shop_id, payload.status)?;
    Ok(Json(UpdateStatusResponse {
        shop_order: result.shop_order,
        available_agents: result.available_agents,
    }))
}

#[derive(Deserialize)]
pub struct IssueOtpRequest {
    pub agent_id: Uuid,
}

#[derive(Serialize)]
pub struct OtpIssued {
    pub sent: bool,
}

async fn issue_otp(
    State(state): State<Arc<AppState>>,
    Path((order_id, shop_order_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<IssueOtpRequest>,
) -> Result<Json<OtpIssued>, AppError> {
    gate::issue(&state, order_id, shop_order_id, payload.agent_id)?;
    Ok(Json(OtpIssued { sent: true }))
}

#[derive(Deserialize)]
pub struct VerifyOtpRequest {
    pub agent_id: Uuid,
    pub otp: String,
}

#[derive(Serialize)]
pub struct VerifyOtpResponse {
    #[serde(flatten)]
    pub shop_order: ShopOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

async fn verify_otp(
    State(state): State<Arc<AppState>>,
    Path((order_id, shop_order_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<VerifyOtpRequest>,
) -> Result<Json<VerifyOtpResponse>, AppError> {
    match gate::verify(&state, order_id, shop_order_id, payload.agent_id, &payload.otp)? {
        VerifyOutcome::Delivered(shop_order) => Ok(Json(VerifyOtpResponse {
            shop_order,
            message: None,
        })),
        VerifyOutcome::AlreadyDelivered => {
            let shop_order = state.ledger.shop_order(order_id, shop_order_id)?;
            Ok(Json(VerifyOtpResponse {
                shop_order,
                message: Some("already delivered".to_string()),
            }))
        }
    }
}
