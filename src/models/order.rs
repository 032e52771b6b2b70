use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::agent::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cod,
    Online,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAddress {
    pub text: String,
    pub location: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub item_id: Uuid,
    pub name: String,
    pub price: i64,
    pub quantity: u32,
}

impl ItemSnapshot {
    pub fn line_total(&self) -> Option<i64> {
        self.price.checked_mul(i64::from(self.quantity))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShopOrderStatus {
    Pending,
    Preparing,
    ReadyForPickup,
    OutForDelivery,
    Delivered,
    Cancelled,
}

impl ShopOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ShopOrderStatus::Delivered | ShopOrderStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: ShopOrderStatus) -> bool {
        use ShopOrderStatus::*;

        match (self, next) {
            (Pending, Preparing)
            | (Preparing, ReadyForPickup)
            | (ReadyForPickup, OutForDelivery)
            | (OutForDelivery, Delivered) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ShopOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShopOrderStatus::Pending => "pending",
            ShopOrderStatus::Preparing => "preparing",
            ShopOrderStatus::ReadyForPickup => "ready_for_pickup",
            ShopOrderStatus::OutForDelivery => "out_for_delivery",
            ShopOrderStatus::Delivered => "delivered",
            ShopOrderStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShopOrder {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub shop_name: String,
    pub shop_location: GeoPoint,
    pub items: Vec<ItemSnapshot>,
    pub subtotal: i64,
    pub status: ShopOrderStatus,
    pub assigned_agent: Option<Uuid>,
    #[serde(skip_serializing)]
    pub otp_hash: Option<String>,
    #[serde(skip_serializing)]
    pub otp_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub otp_attempts_left: u32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ShopOrder {
    pub(crate) fn apply_status(&mut self, next: ShopOrderStatus) {
        let now = Utc::now();
        self.status = next;
        self.version += 1;
        self.updated_at = now;

        if next == ShopOrderStatus::Delivered {
            self.delivered_at = Some(now);
        }
        if next.is_terminal() {
            self.clear_otp();
        }
    }

    pub(crate) fn clear_otp(&mut self) {
        self.otp_hash = None;
        self.otp_expires_at = None;
        self.otp_attempts_left = 0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub delivery_address: DeliveryAddress,
    pub payment_method: PaymentMethod,
    pub payment_verified: bool,
    pub delivery_fee: i64,
    pub discount: i64,
    pub total_amount: i64,
    pub shop_orders: Vec<ShopOrder>,
    pub created_at: DateTime<Utc>,
}
