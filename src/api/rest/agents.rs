use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::dispatch::{self, ActiveDelivery};
use crate::engine::broker::{self, AcceptOutcome};
use crate::error::AppError;
use crate::ledger::HourlyDeliveries;
use crate::models::agent::{AgentPresence, GeoPoint};
use crate::models::assignment::AssignmentOffer;
use crate::models::order::ShopOrder;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/agents", post(register_agent).get(list_agents))
        .route("/agents/:id/location", patch(update_location))
        .route("/agents/:id/assignments", get(list_offers))
        .route("/agents/:id/assignments/current", get(current_assignment))
        .route("/agents/:id/deliveries/today", get(deliveries_today))
        .route("/assignments/:id/accept", post(accept_assignment))
}

#[derive(Deserialize)]
pub struct RegisterAgentRequest {
    pub name: String,
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Deserialize)]
pub struct AcceptRequest {
    pub agent_id: Uuid,
}

async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterAgentRequest>,
) -> Result<Json<AgentPresence>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if !payload.location.in_range() {
        return Err(AppError::Validation(
            "coordinates out of range".to_string(),
        ));
    }

    Ok(Json(state.geo.register(payload.name, payload.location)))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentPresence>> {
    Json(state.geo.all())
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<AgentPresence>, AppError> {
    let presence = dispatch::record_location(&state, id, payload.lat, payload.lng)?;
    Ok(Json(presence))
}

async fn list_offers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<Vec<AssignmentOffer>> {
    Json(dispatch::offered_assignments(&state, id))
}

async fn current_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ActiveDelivery>, AppError> {
    let delivery = dispatch::current_assignment(&state, id)?;
    Ok(Json(delivery))
}

async fn deliveries_today(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<Vec<HourlyDeliveries>> {
    Json(state.ledger.today_deliveries(id))
}

async fn accept_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AcceptRequest>,
) -> Result<Json<ShopOrder>, AppError> {
    match broker::accept(&state, id, payload.agent_id)? {
        AcceptOutcome::Won(shop_order) => Ok(Json(shop_order)),
        AcceptOutcome::AlreadyYours => {
            let (order_id, shop_order_id) = state
                .assignments
                .get(&id)
                .map(|a| (a.order_id, a.shop_order_id))
                .ok_or_else(|| AppError::NotFound(format!("assignment {id} not found")))?;
            let shop_order = state.ledger.shop_order(order_id, shop_order_id)?;
            Ok(Json(shop_order))
        }
    }
}
