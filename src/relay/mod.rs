use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, Entry};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::assignment::AssignmentOffer;
use crate::models::order::{
    DeliveryAddress, ItemSnapshot, PaymentMethod, ShopOrder, ShopOrderStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Agent(Uuid),
    Order(Uuid),
    Shop(Uuid),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Agent(id) => write!(f, "agent:{id}"),
            Channel::Order(id) => write!(f, "order:{id}"),
            Channel::Shop(id) => write!(f, "shop:{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    NewAssignment(AssignmentOffer),
    AssignmentClosed {
        assignment_id: Uuid,
    },
    UpdateDeliveryLocation {
        agent_id: Uuid,
        lat: f64,
        lng: f64,
        timestamp: DateTime<Utc>,
    },
    NewOrder {
        order_id: Uuid,
        shop_id: Uuid,
        shop_order_id: Uuid,
        items: Vec<ItemSnapshot>,
        subtotal: i64,
        delivery_address: DeliveryAddress,
        payment_method: PaymentMethod,
    },
    UpdateStatus {
        order_id: Uuid,
        shop_id: Uuid,
        shop_order_id: Uuid,
        status: ShopOrderStatus,
        assigned_agent: Option<Uuid>,
        version: u64,
    },
    AgentSearching {
        order_id: Uuid,
        shop_order_id: Uuid,
        attempt: u32,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connected_at: DateTime<Utc>,
}

pub struct Relay {
    channels: DashMap<Channel, broadcast::Sender<RelayEvent>>,
    connections: DashMap<(Channel, Uuid), ConnectionInfo>,
    location_marks: DashMap<Uuid, Instant>,
    buffer: usize,
    min_location_interval: Duration,
}

impl Relay {
    pub fn new(buffer: usize, min_location_interval: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            connections: DashMap::new(),
            location_marks: DashMap::new(),
            buffer,
            min_location_interval,
        }
    }

    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<RelayEvent> {
        self.channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe()
    }

    pub fn publish(&self, channel: Channel, event: RelayEvent) -> usize {
        let delivered = match self.channels.get(&channel) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        };
        debug!(channel = %channel, delivered, "relay event published");
        delivered
    }

    pub fn register(&self, channel: Channel, connection_id: Uuid) {
        self.connections.insert(
            (channel, connection_id),
            ConnectionInfo {
                connected_at: Utc::now(),
            },
        );
    }

    pub fn unregister(&self, channel: Channel, connection_id: Uuid) -> Option<ConnectionInfo> {
        let removed = self
            .connections
            .remove(&(channel, connection_id))
            .map(|(_, info)| info);

        let channel_empty = !self
            .connections
            .iter()
            .any(|entry| entry.key().0 == channel);
        if channel_empty {
            self.channels.remove(&channel);
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn allow_location(&self, agent_id: Uuid) -> bool {
        let now = Instant::now();
        match self.location_marks.entry(agent_id) {
            Entry::Occupied(mut mark) => {
                if now.duration_since(*mark.get()) >= self.min_location_interval {
                    mark.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }
}

pub fn publish_status_update(relay: &Relay, order_id: Uuid, shop_order: &ShopOrder) {
    let event = RelayEvent::UpdateStatus {
        order_id,
        shop_id: shop_order.shop_id,
        shop_order_id: shop_order.id,
        status: shop_order.status,
        assigned_agent: shop_order.assigned_agent,
        version: shop_order.version,
    };
    relay.publish(Channel::Order(order_id), event.clone());
    relay.publish(Channel::Shop(shop_order.shop_id), event);
}
