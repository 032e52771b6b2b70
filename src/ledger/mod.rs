use chrono::{Timelike, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::order::{Order, PaymentMethod, ShopOrder, ShopOrderStatus};

#[derive(Debug, Clone, Serialize)]
pub struct HourlyDeliveries {
    pub hour: u32,
    pub count: u64,
}

pub struct OrderLedger {
    orders: DashMap<Uuid, Order>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
        }
    }

    pub fn insert(&self, order: Order) {
        self.orders.insert(order.id, order);
    }

    pub fn get(&self, order_id: Uuid) -> Option<Order> {
        self.orders.get(&order_id).map(|o| o.clone())
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn with_order<R>(
        &self,
        order_id: Uuid,
        f: impl FnOnce(&mut Order) -> R,
    ) -> Result<R, AppError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;
        Ok(f(&mut order))
    }

    pub fn with_shop_order<R>(
        &self,
        order_id: Uuid,
        shop_order_id: Uuid,
        f: impl FnOnce(&mut ShopOrder) -> R,
    ) -> Result<R, AppError> {
        self.with_order(order_id, |order| {
            match order.shop_orders.iter_mut().find(|s| s.id == shop_order_id) {
                Some(shop_order) => Ok(f(shop_order)),
                None => Err(AppError::NotFound(format!(
                    "shop order {shop_order_id} not found in order {order_id}"
                ))),
            }
        })?
    }

    pub fn transition(
        &self,
        order_id: Uuid,
        shop_order_id: Uuid,
        to: ShopOrderStatus,
    ) -> Result<ShopOrder, AppError> {
        self.with_shop_order(order_id, shop_order_id, |shop_order| {
            if !shop_order.status.can_transition_to(to) {
                return Err(AppError::Conflict(format!(
                    "cannot move shop order from {} to {}",
                    shop_order.status, to
                )));
            }
            shop_order.apply_status(to);
            Ok(shop_order.clone())
        })?
    }

    pub fn shop_order(&self, order_id: Uuid, shop_order_id: Uuid) -> Result<ShopOrder, AppError> {
        self.with_shop_order(order_id, shop_order_id, |shop_order| shop_order.clone())
    }

    pub fn shop_order_status(
        &self,
        order_id: Uuid,
        shop_order_id: Uuid,
    ) -> Result<ShopOrderStatus, AppError> {
        self.with_shop_order(order_id, shop_order_id, |shop_order| shop_order.status)
    }

    pub fn find_shop_order_id(&self, order_id: Uuid, shop_id: Uuid) -> Result<Uuid, AppError> {
        self.with_order(order_id, |order| {
            order
                .shop_orders
                .iter()
                .find(|s| s.shop_id == shop_id)
                .map(|s| s.id)
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "order {order_id} has no shop order for shop {shop_id}"
                    ))
                })
        })?
    }

    pub fn set_payment_verified(&self, order_id: Uuid) -> Result<(Order, bool), AppError> {
        self.with_order(order_id, |order| {
            if order.payment_method != PaymentMethod::Online {
                return Err(AppError::Conflict(
                    "cash-on-delivery orders have no payment verification".to_string(),
                ));
            }
            let newly_verified = !order.payment_verified;
            order.payment_verified = true;
            Ok((order.clone(), newly_verified))
        })?
    }

    pub fn today_deliveries(&self, agent_id: Uuid) -> Vec<HourlyDeliveries> {
        let today = Utc::now().date_naive();
        let mut buckets = [0u64; 24];

        for order in self.orders.iter() {
            for shop_order in &order.shop_orders {
                if shop_order.status != ShopOrderStatus::Delivered {
                    continue;
                }
                if shop_order.assigned_agent != Some(agent_id) {
                    continue;
                }
                if let Some(delivered_at) = shop_order.delivered_at {
                    if delivered_at.date_naive() == today {
                        buckets[delivered_at.hour() as usize] += 1;
                    }
                }
            }
        }

        buckets
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(hour, count)| HourlyDeliveries {
                hour: hour as u32,
                count: *count,
            })
            .collect()
    }
}
