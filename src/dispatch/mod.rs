use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::engine::broker::{self, RoundOutcome};
use crate::engine::watch::{spawn_offer_watch, WatchPlan};
use crate::error::AppError;
use crate::geo::Candidate;
use crate::models::agent::{AgentPresence, GeoPoint};
use crate::models::assignment::AssignmentOffer;
use crate::models::order::{
    DeliveryAddress, ItemSnapshot, Order, PaymentMethod, ShopOrder, ShopOrderStatus,
};
use crate::relay::{publish_status_update, Channel, RelayEvent};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CartItemInput {
    pub item_id: Uuid,
    pub name: String,
    pub price: i64,
    pub quantity: u32,
    pub shop_id: Uuid,
    pub shop_name: String,
    pub shop_location: GeoPoint,
}

#[derive(Debug, Deserialize)]
pub struct PlaceOrderRequest {
    pub customer_id: Uuid,
    pub payment_method: PaymentMethod,
    pub delivery_address: DeliveryAddress,
    pub total_amount: i64,
    #[serde(default)]
    pub discount: Option<i64>,
    pub cart_items: Vec<CartItemInput>,
}

#[derive(Debug, Serialize)]
pub struct CandidateView {
    pub agent_id: Uuid,
    pub name: String,
    pub distance_km: f64,
}

pub struct StatusChangeResult {
    pub shop_order: ShopOrder,
    pub available_agents: Option<Vec<CandidateView>>,
}

#[derive(Debug, Serialize)]
pub struct ActiveDelivery {
    pub order_id: Uuid,
    pub shop_order_id: Uuid,
    pub shop_name: String,
    pub shop_location: GeoPoint,
    pub delivery_address: DeliveryAddress,
    pub items: Vec<ItemSnapshot>,
    pub subtotal: i64,
    pub status: ShopOrderStatus,
}

pub fn place_order(state: &AppState, request: PlaceOrderRequest) -> Result<Order, AppError> {
    if request.cart_items.is_empty() {
        return Err(AppError::Validation("cart is empty".to_string()));
    }
    if request.delivery_address.text.trim().is_empty() {
        return Err(AppError::Validation(
            "delivery address text is required".to_string(),
        ));
    }
    if !request.delivery_address.location.in_range() {
        return Err(AppError::Validation(
            "delivery address coordinates out of range".to_string(),
        ));
    }
    let discount = request.discount.unwrap_or(0);
    if discount < 0 {
        return Err(AppError::Validation(
            "discount cannot be negative".to_string(),
        ));
    }

    for item in &request.cart_items {
        if item.quantity < 1 {
            return Err(AppError::Validation(format!(
                "item {} has zero quantity",
                item.name
            )));
        }
        if item.price < 0 {
            return Err(AppError::Validation(format!(
                "item {} has a negative price",
                item.name
            )));
        }
        if item.name.trim().is_empty() || item.shop_name.trim().is_empty() {
            return Err(AppError::Validation(
                "item and shop names are required".to_string(),
            ));
        }
        if !item.shop_location.in_range() {
            return Err(AppError::Validation(format!(
                "shop {} has coordinates out of range",
                item.shop_name
            )));
        }
    }

    let mut groups: Vec<(Uuid, Vec<&CartItemInput>)> = Vec::new();
    for item in &request.cart_items {
        match groups.iter_mut().find(|(shop_id, _)| *shop_id == item.shop_id) {
            Some((_, items)) => items.push(item),
            None => groups.push((item.shop_id, vec![item])),
        }
    }

    let now = Utc::now();
    let mut shop_orders = Vec::with_capacity(groups.len());
    for (shop_id, items) in &groups {
        let first = items[0];
        for item in items {
            if item.shop_name != first.shop_name || item.shop_location != first.shop_location {
                return Err(AppError::Validation(format!(
                    "cart lines disagree about shop {shop_id}"
                )));
            }
        }
        let snapshots: Vec<ItemSnapshot> = items
            .iter()
            .map(|item| ItemSnapshot {
                item_id: item.item_id,
                name: item.name.clone(),
                price: item.price,
                quantity: item.quantity,
            })
            .collect();
        let mut subtotal: i64 = 0;
        for item in &snapshots {
            let line = item.line_total().ok_or_else(|| {
                AppError::Validation(format!("item {} line total is out of range", item.name))
            })?;
            subtotal = subtotal
                .checked_add(line)
                .ok_or_else(|| AppError::Validation("order amounts are out of range".to_string()))?;
        }
        shop_orders.push(ShopOrder {
            id: Uuid::new_v4(),
            shop_id: *shop_id,
            shop_name: first.shop_name.clone(),
            shop_location: first.shop_location,
            items: snapshots,
            subtotal,
            status: ShopOrderStatus::Pending,
            assigned_agent: None,
            otp_hash: None,
            otp_expires_at: None,
            otp_attempts_left: 0,
            delivered_at: None,
            version: 1,
            updated_at: now,
        });
    }

    let mut items_total: i64 = 0;
    for shop_order in &shop_orders {
        items_total = items_total
            .checked_add(shop_order.subtotal)
            .ok_or_else(|| AppError::Validation("order amounts are out of range".to_string()))?;
    }
    let computed_total = items_total
        .checked_add(state.config.delivery_fee)
        .and_then(|total| total.checked_sub(discount))
        .ok_or_else(|| AppError::Validation("order amounts are out of range".to_string()))?;
    if computed_total < 0 {
        return Err(AppError::Validation(
            "discount exceeds the order value".to_string(),
        ));
    }
    if computed_total != request.total_amount {
        return Err(AppError::Validation(format!(
            "total_amount mismatch: expected {computed_total}"
        )));
    }

    let order = Order {
        id: Uuid::new_v4(),
        customer_id: request.customer_id,
        delivery_address: request.delivery_address,
        payment_method: request.payment_method,
        payment_verified: false,
        delivery_fee: state.config.delivery_fee,
        discount,
        total_amount: computed_total,
        shop_orders,
        created_at: now,
    };
    state.ledger.insert(order.clone());
    state.metrics.orders_placed_total.inc();

    if order.payment_method == PaymentMethod::Cod {
        announce_to_shops(state, &order);
    }

    info!(
        order_id = %order.id,
        customer_id = %order.customer_id,
        shops = order.shop_orders.len(),
        total = order.total_amount,
        payment = ?order.payment_method,
        "order placed"
    );
    Ok(order)
}

pub fn verify_payment(state: &AppState, order_id: Uuid) -> Result<Order, AppError> {
    let (order, newly_verified) = state.ledger.set_payment_verified(order_id)?;
    if newly_verified {
        announce_to_shops(state, &order);
        info!(order_id = %order_id, "online payment verified");
    }
    Ok(order)
}

fn announce_to_shops(state: &AppState, order: &Order) {
    for shop_order in &order.shop_orders {
        state.relay.publish(
            Channel::Shop(shop_order.shop_id),
            RelayEvent::NewOrder {
                order_id: order.id,
                shop_id: shop_order.shop_id,
                shop_order_id: shop_order.id,
                items: shop_order.items.clone(),
                subtotal: shop_order.subtotal,
                delivery_address: order.delivery_address.clone(),
                payment_method: order.payment_method,
            },
        );
    }
}

pub fn update_status(
    state: &Arc<AppState>,
    order_id: Uuid,
    shop_id: Uuid,
    requested: ShopOrderStatus,
) -> Result<StatusChangeResult, AppError> {
    let shop_order_id = state.ledger.find_shop_order_id(order_id, shop_id)?;

    match requested {
        ShopOrderStatus::Preparing
        | ShopOrderStatus::ReadyForPickup
        | ShopOrderStatus::Cancelled => {}
        _ => {
            return Err(AppError::Validation(format!(
                "shops may set preparing, ready_for_pickup or cancelled, not {requested}"
            )));
        }
    }

    if requested == ShopOrderStatus::Cancelled {
        let shop_order = cancel_shop_order(state, order_id, shop_order_id)?;
        return Ok(StatusChangeResult {
            shop_order,
            available_agents: None,
        });
    }

    if requested == ShopOrderStatus::ReadyForPickup {
        let order = state
            .ledger
            .get(order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;
        if order.payment_method == PaymentMethod::Online && !order.payment_verified {
            return Err(AppError::Conflict(
                "online payment is not verified yet".to_string(),
            ));
        }
    }

    let shop_order = state.ledger.transition(order_id, shop_order_id, requested)?;
    publish_status_update(&state.relay, order_id, &shop_order);

    if shop_order.status != ShopOrderStatus::ReadyForPickup {
        return Ok(StatusChangeResult {
            shop_order,
            available_agents: None,
        });
    }

    let mut exclude = HashSet::new();
    let available_agents =
        match broker::open_round(state, order_id, shop_order_id, &mut exclude, 0)? {
            RoundOutcome::Broadcast {
                assignment,
                candidates,
            } => {
                spawn_offer_watch(
                    state,
                    order_id,
                    shop_order_id,
                    WatchPlan::AwaitExpiry {
                        assignment_id: assignment.id,
                        until: assignment.expires_at,
                    },
                    1,
                );
                Some(candidate_views(&candidates))
            }
            RoundOutcome::NoCandidates { shop_id } => {
                let searching = RelayEvent::AgentSearching {
                    order_id,
                    shop_order_id,
                    attempt: 0,
                };
                state
                    .relay
                    .publish(Channel::Order(order_id), searching.clone());
                state.relay.publish(Channel::Shop(shop_id), searching);
                spawn_offer_watch(
                    state,
                    order_id,
                    shop_order_id,
                    WatchPlan::Backoff { attempt: 0 },
                    0,
                );
                Some(Vec::new())
            }
            RoundOutcome::Ineligible => None,
        };

    Ok(StatusChangeResult {
        shop_order,
        available_agents,
    })
}

pub fn cancel_shop_order(
    state: &AppState,
    order_id: Uuid,
    shop_order_id: Uuid,
) -> Result<ShopOrder, AppError> {
    let shop_order = state.ledger.with_order(order_id, |order| {
        let Some(shop_order) = order.shop_orders.iter_mut().find(|s| s.id == shop_order_id)
        else {
            return Err(AppError::NotFound(format!(
                "shop order {shop_order_id} not found in order {order_id}"
            )));
        };
        if !shop_order.status.can_transition_to(ShopOrderStatus::Cancelled) {
            return Err(AppError::Conflict(format!(
                "cannot move shop order from {} to {}",
                shop_order.status,
                ShopOrderStatus::Cancelled
            )));
        }
        if let Some(agent_id) = shop_order.assigned_agent {
            if state
                .active_deliveries
                .remove_if(&agent_id, |_, active| *active == (order_id, shop_order_id))
                .is_some()
            {
                state.geo.set_available(agent_id, true);
            }
        }
        shop_order.apply_status(ShopOrderStatus::Cancelled);
        Ok(shop_order.clone())
    })??;

    if let Some((_, watcher)) = state.offer_watchers.remove(&shop_order_id) {
        watcher.abort();
    }
    for (closed_id, members) in broker::invalidate_open_rounds(
        state,
        shop_order_id,
        crate::models::assignment::AssignmentPhase::Cancelled,
        None,
    ) {
        for member in members {
            state.relay.publish(
                Channel::Agent(member),
                RelayEvent::AssignmentClosed {
                    assignment_id: closed_id,
                },
            );
        }
    }
    broker::purge_rounds(state, shop_order_id);
    publish_status_update(&state.relay, order_id, &shop_order);

    info!(
        order_id = %order_id,
        shop_order_id = %shop_order_id,
        "shop order cancelled"
    );
    Ok(shop_order)
}

pub fn record_location(
    state: &AppState,
    agent_id: Uuid,
    lat: f64,
    lng: f64,
) -> Result<AgentPresence, AppError> {
    let point = GeoPoint { lat, lng };
    if !point.in_range() {
        return Err(AppError::Validation(
            "coordinates out of range".to_string(),
        ));
    }
    let presence = state.geo.upsert_location(agent_id, lat, lng);

    let active = state
        .active_deliveries
        .get(&agent_id)
        .map(|entry| *entry.value());
    if let Some((order_id, _)) = active {
        if state.relay.allow_location(agent_id) {
            state.relay.publish(
                Channel::Order(order_id),
                RelayEvent::UpdateDeliveryLocation {
                    agent_id,
                    lat,
                    lng,
                    timestamp: Utc::now(),
                },
            );
        }
    }
    Ok(presence)
}

pub fn current_assignment(
    state: &AppState,
    agent_id: Uuid,
) -> Result<ActiveDelivery, AppError> {
    let Some((order_id, shop_order_id)) = state
        .active_deliveries
        .get(&agent_id)
        .map(|entry| *entry.value())
    else {
        return Err(AppError::NoneActive);
    };

    let order = state
        .ledger
        .get(order_id)
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;
    let shop_order = order
        .shop_orders
        .iter()
        .find(|s| s.id == shop_order_id)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "shop order {shop_order_id} not found in order {order_id}"
            ))
        })?;

    Ok(ActiveDelivery {
        order_id,
        shop_order_id,
        shop_name: shop_order.shop_name.clone(),
        shop_location: shop_order.shop_location,
        delivery_address: order.delivery_address.clone(),
        items: shop_order.items.clone(),
        subtotal: shop_order.subtotal,
        status: shop_order.status,
    })
}

pub fn offered_assignments(state: &AppState, agent_id: Uuid) -> Vec<AssignmentOffer> {
    if state.active_deliveries.contains_key(&agent_id) {
        return Vec::new();
    }

    let now = Utc::now();
    let mut open: Vec<_> = state
        .assignments
        .iter()
        .filter(|a| a.is_open(now) && a.candidates.contains(&agent_id))
        .map(|a| a.clone())
        .collect();
    open.sort_by_key(|a| a.offered_at);

    open.into_iter()
        .filter_map(|assignment| {
            let order = state.ledger.get(assignment.order_id)?;
            let shop_order = order
                .shop_orders
                .iter()
                .find(|s| s.id == assignment.shop_order_id)?;
            Some(AssignmentOffer {
                assignment_id: assignment.id,
                order_id: order.id,
                shop_order_id: shop_order.id,
                shop_name: shop_order.shop_name.clone(),
                delivery_address: order.delivery_address.clone(),
                items: shop_order.items.clone(),
                subtotal: shop_order.subtotal,
                expires_at: assignment.expires_at,
            })
        })
        .collect()
}

fn candidate_views(candidates: &[Candidate]) -> Vec<CandidateView> {
    candidates
        .iter()
        .map(|candidate| CandidateView {
            agent_id: candidate.presence.agent_id,
            name: candidate.presence.name.clone(),
            distance_km: candidate.distance_km,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::engine::broker::AcceptOutcome;

    fn shop_a() -> (Uuid, String, GeoPoint) {
        (
            Uuid::new_v4(),
            "Spice Garden".to_string(),
            GeoPoint {
                lat: 52.52,
                lng: 13.405,
            },
        )
    }

    fn cart_line(
        shop: &(Uuid, String, GeoPoint),
        name: &str,
        price: i64,
        quantity: u32,
    ) -> CartItemInput {
        CartItemInput {
            item_id: Uuid::new_v4(),
            name: name.to_string(),
            price,
            quantity,
            shop_id: shop.0,
            shop_name: shop.1.clone(),
            shop_location: shop.2,
        }
    }

    fn address() -> DeliveryAddress {
        DeliveryAddress {
            text: "Torstrasse 99".to_string(),
            location: GeoPoint {
                lat: 52.529,
                lng: 13.401,
            },
        }
    }

    fn request(total: i64, items: Vec<CartItemInput>) -> PlaceOrderRequest {
        PlaceOrderRequest {
            customer_id: Uuid::new_v4(),
            payment_method: PaymentMethod::Cod,
            delivery_address: address(),
            total_amount: total,
            discount: None,
            cart_items: items,
        }
    }

    #[test]
    fn cart_splits_into_shop_orders_in_first_seen_order() {
        let state = AppState::new(Config::default());
        let a = shop_a();
        let b = (
            Uuid::new_v4(),
            "Noodle House".to_string(),
            GeoPoint {
                lat: 52.51,
                lng: 13.39,
            },
        );

        let order = place_order(
            &state,
            request(
                510,
                vec![
                    cart_line(&a, "Curry", 120, 2),
                    cart_line(&b, "Ramen", 150, 1),
                    cart_line(&a, "Naan", 80, 1),
                ],
            ),
        )
        .unwrap();

        assert_eq!(order.shop_orders.len(), 2);
        assert_eq!(order.shop_orders[0].shop_id, a.0);
        assert_eq!(order.shop_orders[0].items.len(), 2);
        assert_eq!(order.shop_orders[0].subtotal, 320);
        assert_eq!(order.shop_orders[1].shop_id, b.0);
        assert_eq!(order.shop_orders[1].subtotal, 150);
        assert_eq!(order.total_amount, 510);
        assert!(order
            .shop_orders
            .iter()
            .all(|s| s.status == ShopOrderStatus::Pending));
        assert_eq!(state.ledger.len(), 1);
    }

    #[test]
    fn discount_enters_the_total_check() {
        let state = AppState::new(Config::default());
        let a = shop_a();
        let mut req = request(290, vec![cart_line(&a, "Curry", 300, 1)]);
        req.discount = Some(50);

        let order = place_order(&state, req).unwrap();
        assert_eq!(order.total_amount, 290);
        assert_eq!(order.discount, 50);
    }

    #[test]
    fn mismatched_totals_are_rejected() {
        let state = AppState::new(Config::default());
        let a = shop_a();
        let err = place_order(&state, request(999, vec![cart_line(&a, "Curry", 120, 1)]))
            .unwrap_err();
        match err {
            AppError::Validation(msg) => assert!(msg.contains("160"), "message was: {msg}"),
            other => panic!("expected validation, got {other:?}"),
        }
        assert!(state.ledger.is_empty());
    }

    #[test]
    fn overflowing_amounts_are_rejected_not_wrapped() {
        let state = AppState::new(Config::default());
        let a = shop_a();

        let err = place_order(
            &state,
            request(100, vec![cart_line(&a, "Curry", i64::MAX, 2)]),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = place_order(
            &state,
            request(100, vec![cart_line(&a, "Curry", i64::MAX, 1)]),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(state.ledger.is_empty());
    }

    #[test]
    fn degenerate_carts_are_rejected() {
        let state = AppState::new(Config::default());
        let a = shop_a();

        assert!(matches!(
            place_order(&state, request(40, vec![])),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            place_order(&state, request(160, vec![cart_line(&a, "Curry", 120, 0)])),
            Err(AppError::Validation(_))
        ));

        let mut twisted = cart_line(&a, "Naan", 80, 1);
        twisted.shop_name = "Someone Else".to_string();
        assert!(matches!(
            place_order(
                &state,
                request(240, vec![cart_line(&a, "Curry", 120, 1), twisted])
            ),
            Err(AppError::Validation(_))
        ));

        let mut off_map = request(160, vec![cart_line(&a, "Curry", 120, 1)]);
        off_map.delivery_address.location.lat = 123.0;
        assert!(matches!(
            place_order(&state, off_map),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn online_orders_reach_shops_only_after_payment() {
        let state = AppState::new(Config::default());
        let a = shop_a();
        let mut shop_feed = state.relay.subscribe(Channel::Shop(a.0));

        let mut req = request(160, vec![cart_line(&a, "Curry", 120, 1)]);
        req.payment_method = PaymentMethod::Online;
        let order = place_order(&state, req).unwrap();

        assert!(shop_feed.try_recv().is_err());

        let verified = verify_payment(&state, order.id).unwrap();
        assert!(verified.payment_verified);
        assert!(matches!(
            shop_feed.try_recv(),
            Ok(RelayEvent::NewOrder { .. })
        ));

        verify_payment(&state, order.id).unwrap();
        assert!(shop_feed.try_recv().is_err());
    }

    #[test]
    fn unpaid_online_orders_cannot_become_ready() {
        let state = Arc::new(AppState::new(Config::default()));
        let a = shop_a();
        let mut req = request(160, vec![cart_line(&a, "Curry", 120, 1)]);
        req.payment_method = PaymentMethod::Online;
        let order = place_order(&state, req).unwrap();

        update_status(&state, order.id, a.0, ShopOrderStatus::Preparing).unwrap();
        assert!(matches!(
            update_status(&state, order.id, a.0, ShopOrderStatus::ReadyForPickup),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn owners_cannot_set_agent_statuses() {
        let state = Arc::new(AppState::new(Config::default()));
        let a = shop_a();
        let order = place_order(&state, request(160, vec![cart_line(&a, "Curry", 120, 1)]))
            .unwrap();

        for requested in [ShopOrderStatus::OutForDelivery, ShopOrderStatus::Delivered] {
            assert!(matches!(
                update_status(&state, order.id, a.0, requested),
                Err(AppError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn ready_edge_opens_the_search_and_reports_nearby_agents() {
        let state = Arc::new(AppState::new(Config::default()));
        let a = shop_a();
        let rider = state.geo.register(
            "Asha".to_string(),
            GeoPoint {
                lat: 52.521,
                lng: 13.404,
            },
        );
        let order = place_order(&state, request(160, vec![cart_line(&a, "Curry", 120, 1)]))
            .unwrap();
        let shop_order_id = order.shop_orders[0].id;

        update_status(&state, order.id, a.0, ShopOrderStatus::Preparing).unwrap();
        let result =
            update_status(&state, order.id, a.0, ShopOrderStatus::ReadyForPickup).unwrap();

        let nearby = result.available_agents.expect("search must have opened");
        assert_eq!(nearby.len(), 1);
        assert_eq!(nearby[0].agent_id, rider.agent_id);
        assert!(state.offer_watchers.contains_key(&shop_order_id));
        assert_eq!(state.assignments.len(), 1);
        assert_eq!(offered_assignments(&state, rider.agent_id).len(), 1);
    }

    #[tokio::test]
    async fn cancel_releases_the_agent_and_withdraws_rounds() {
        let state = Arc::new(AppState::new(Config::default()));
        let a = shop_a();
        let rider = state.geo.register(
            "Bruno".to_string(),
            GeoPoint {
                lat: 52.521,
                lng: 13.404,
            },
        );
        let order = place_order(&state, request(160, vec![cart_line(&a, "Curry", 120, 1)]))
            .unwrap();
        let shop_order_id = order.shop_orders[0].id;

        update_status(&state, order.id, a.0, ShopOrderStatus::Preparing).unwrap();
        let result =
            update_status(&state, order.id, a.0, ShopOrderStatus::ReadyForPickup).unwrap();
        assert_eq!(result.available_agents.map(|v| v.len()), Some(1));

        let offers = offered_assignments(&state, rider.agent_id);
        assert!(matches!(
            broker::accept(&state, offers[0].assignment_id, rider.agent_id),
            Ok(AcceptOutcome::Won(_))
        ));
        assert!(!state.geo.get(rider.agent_id).unwrap().available);

        let cancelled =
            update_status(&state, order.id, a.0, ShopOrderStatus::Cancelled).unwrap();
        assert_eq!(cancelled.shop_order.status, ShopOrderStatus::Cancelled);
        assert!(state.geo.get(rider.agent_id).unwrap().available);
        assert!(state.active_deliveries.get(&rider.agent_id).is_none());
        assert!(state.assignments.is_empty());
        assert!(matches!(
            current_assignment(&state, rider.agent_id),
            Err(AppError::NoneActive)
        ));
    }

    #[test]
    fn location_updates_validate_coordinates() {
        let state = AppState::new(Config::default());
        let rider = state.geo.register(
            "Cleo".to_string(),
            GeoPoint {
                lat: 52.52,
                lng: 13.40,
            },
        );

        assert!(matches!(
            record_location(&state, rider.agent_id, 91.0, 0.0),
            Err(AppError::Validation(_))
        ));
        record_location(&state, rider.agent_id, 52.53, 13.41).unwrap();
        let seen = state.geo.get(rider.agent_id).unwrap();
        assert_eq!(seen.location.lat, 52.53);
    }

    #[test]
    fn mid_delivery_locations_reach_the_order_feed_rate_limited() {
        let mut config = Config::default();
        config.location_min_interval_ms = 60_000;
        let state = AppState::new(config);
        let rider = state.geo.register(
            "Dev".to_string(),
            GeoPoint {
                lat: 52.52,
                lng: 13.40,
            },
        );
        let order_id = Uuid::new_v4();
        state
            .active_deliveries
            .insert(rider.agent_id, (order_id, Uuid::new_v4()));
        let mut order_feed = state.relay.subscribe(Channel::Order(order_id));

        record_location(&state, rider.agent_id, 52.53, 13.41).unwrap();
        record_location(&state, rider.agent_id, 52.54, 13.42).unwrap();

        assert!(matches!(
            order_feed.try_recv(),
            Ok(RelayEvent::UpdateDeliveryLocation { lat, .. }) if lat == 52.53
        ));
        assert!(order_feed.try_recv().is_err());
        assert_eq!(state.geo.get(rider.agent_id).unwrap().location.lat, 52.54);
    }
}
