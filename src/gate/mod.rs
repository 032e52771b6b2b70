use chrono::{Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::order::{ShopOrder, ShopOrderStatus};
use crate::relay::publish_status_update;
use crate::state::AppState;

pub trait OtpDelivery: Send + Sync {
    fn deliver(&self, order_id: Uuid, shop_order_id: Uuid, customer_id: Uuid, code: &str);
}

pub struct LogOtpDelivery;

impl OtpDelivery for LogOtpDelivery {
    fn deliver(&self, order_id: Uuid, shop_order_id: Uuid, customer_id: Uuid, _code: &str) {
        info!(
            order_id = %order_id,
            shop_order_id = %shop_order_id,
            customer_id = %customer_id,
            "delivery code handed to contact channel"
        );
    }
}

#[derive(Debug)]
pub enum VerifyOutcome {
    Delivered(ShopOrder),
    AlreadyDelivered,
}

fn generate_code() -> String {
    let mut rng = OsRng;
    format!("{}", rng.gen_range(100_000..1_000_000))
}

fn hash_code(shop_order_id: Uuid, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{shop_order_id}:{code}").as_bytes());
    hex::encode(hasher.finalize())
}

pub fn issue(
    state: &AppState,
    order_id: Uuid,
    shop_order_id: Uuid,
    agent_id: Uuid,
) -> Result<(), AppError> {
    let code = generate_code();
    let digest = hash_code(shop_order_id, &code);
    let expires_at = Utc::now() + Duration::seconds(state.config.otp_ttl_secs as i64);
    let attempts = state.config.otp_max_attempts;

    let customer_id = state.ledger.with_order(order_id, |order| {
        let customer_id = order.customer_id;
        let Some(shop_order) = order.shop_orders.iter_mut().find(|s| s.id == shop_order_id)
        else {
            return Err(AppError::NotFound(format!(
                "shop order {shop_order_id} not found in order {order_id}"
            )));
        };

        if shop_order.assigned_agent != Some(agent_id) {
            return Err(AppError::Conflict(
                "only the assigned agent can request a delivery code".to_string(),
            ));
        }
        if shop_order.status != ShopOrderStatus::OutForDelivery {
            return Err(AppError::Conflict(format!(
                "shop order is {}, delivery codes exist only out for delivery",
                shop_order.status
            )));
        }

        shop_order.otp_hash = Some(digest.clone());
        shop_order.otp_expires_at = Some(expires_at);
        shop_order.otp_attempts_left = attempts;
        Ok(customer_id)
    })??;

    state
        .otp_delivery
        .deliver(order_id, shop_order_id, customer_id, &code);

    info!(
        order_id = %order_id,
        shop_order_id = %shop_order_id,
        agent_id = %agent_id,
        "delivery code issued"
    );
    Ok(())
}

pub fn verify(
    state: &AppState,
    order_id: Uuid,
    shop_order_id: Uuid,
    agent_id: Uuid,
    submitted: &str,
) -> Result<VerifyOutcome, AppError> {
    let verdict = state.ledger.with_order(order_id, |order| {
        let Some(shop_order) = order.shop_orders.iter_mut().find(|s| s.id == shop_order_id)
        else {
            return Err(AppError::NotFound(format!(
                "shop order {shop_order_id} not found in order {order_id}"
            )));
        };

        if shop_order.assigned_agent != Some(agent_id) {
            return Err(AppError::Conflict(
                "only the assigned agent can confirm delivery".to_string(),
            ));
        }
        if shop_order.status == ShopOrderStatus::Delivered {
            return Ok(VerifyOutcome::AlreadyDelivered);
        }
        if shop_order.status != ShopOrderStatus::OutForDelivery {
            return Err(AppError::Conflict(format!(
                "shop order is {}, not out for delivery",
                shop_order.status
            )));
        }

        let (Some(expected), Some(expires_at)) =
            (shop_order.otp_hash.clone(), shop_order.otp_expires_at)
        else {
            return Err(AppError::Conflict(
                "no delivery code issued for this shop order".to_string(),
            ));
        };

        if Utc::now() > expires_at {
            shop_order.clear_otp();
            return Err(AppError::Expired(
                "delivery code expired, request a new one".to_string(),
            ));
        }

        if hash_code(shop_order.id, submitted) != expected {
            shop_order.otp_attempts_left = shop_order.otp_attempts_left.saturating_sub(1);
            let attempts_remaining = shop_order.otp_attempts_left;
            if attempts_remaining == 0 {
                shop_order.clear_otp();
            }
            return Err(AppError::OtpMismatch { attempts_remaining });
        }

        shop_order.apply_status(ShopOrderStatus::Delivered);
        if state
            .active_deliveries
            .remove_if(&agent_id, |_, active| *active == (order_id, shop_order_id))
            .is_some()
        {
            state.geo.set_available(agent_id, true);
        }
        Ok(VerifyOutcome::Delivered(shop_order.clone()))
    })?;

    match &verdict {
        Ok(VerifyOutcome::Delivered(shop_order)) => {
            crate::engine::broker::purge_rounds(state, shop_order_id);
            publish_status_update(&state.relay, order_id, shop_order);
            state
                .metrics
                .otp_verifications_total
                .with_label_values(&["delivered"])
                .inc();
            info!(
                order_id = %order_id,
                shop_order_id = %shop_order_id,
                agent_id = %agent_id,
                "delivery confirmed"
            );
        }
        Ok(VerifyOutcome::AlreadyDelivered) => {
            state
                .metrics
                .otp_verifications_total
                .with_label_values(&["repeat"])
                .inc();
        }
        Err(AppError::OtpMismatch { attempts_remaining }) => {
            let outcome = if *attempts_remaining == 0 {
                "exhausted"
            } else {
                "mismatch"
            };
            state
                .metrics
                .otp_verifications_total
                .with_label_values(&[outcome])
                .inc();
        }
        Err(AppError::Expired(_)) => {
            state
                .metrics
                .otp_verifications_total
                .with_label_values(&["expired"])
                .inc();
        }
        Err(_) => {}
    }

    verdict
}
