use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::{DeliveryAddress, ItemSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPhase {
    Open,
    Won,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub shop_order_id: Uuid,
    pub candidates: Vec<Uuid>,
    pub winning_agent: Option<Uuid>,
    pub phase: AssignmentPhase,
    pub round: u32,
    pub offered_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Assignment {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.phase == AssignmentPhase::Open && now <= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentOffer {
    pub assignment_id: Uuid,
    pub order_id: Uuid,
    pub shop_order_id: Uuid,
    pub shop_name: String,
    pub delivery_address: DeliveryAddress,
    pub items: Vec<ItemSnapshot>,
    pub subtotal: i64,
    pub expires_at: DateTime<Utc>,
}
