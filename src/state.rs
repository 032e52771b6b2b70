use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::gate::{LogOtpDelivery, OtpDelivery};
use crate::geo::GeoIndex;
use crate::ledger::OrderLedger;
use crate::models::assignment::Assignment;
use crate::observability::metrics::Metrics;
use crate::relay::Relay;

pub struct AppState {
    pub config: Config,
    pub ledger: OrderLedger,
    pub geo: GeoIndex,
    pub relay: Relay,
    pub assignments: DashMap<Uuid, Assignment>,
    pub offer_watchers: DashMap<Uuid, AbortHandle>,
    pub active_deliveries: DashMap<Uuid, (Uuid, Uuid)>,
    pub otp_delivery: Arc<dyn OtpDelivery>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let relay = Relay::new(
            config.event_buffer_size,
            Duration::from_millis(config.location_min_interval_ms),
        );
        Self {
            config,
            ledger: OrderLedger::new(),
            geo: GeoIndex::new(),
            relay,
            assignments: DashMap::new(),
            offer_watchers: DashMap::new(),
            active_deliveries: DashMap::new(),
            otp_delivery: Arc::new(LogOtpDelivery),
            metrics: Metrics::new(),
        }
    }
}
