use std::collections::HashSet;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::agent::{AgentPresence, GeoPoint};

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub presence: AgentPresence,
    pub distance_km: f64,
}

pub struct GeoIndex {
    presence: DashMap<Uuid, AgentPresence>,
}

impl GeoIndex {
    pub fn new() -> Self {
        Self {
            presence: DashMap::new(),
        }
    }

    pub fn register(&self, name: String, location: GeoPoint) -> AgentPresence {
        let agent = AgentPresence {
            agent_id: Uuid::new_v4(),
            name,
            location,
            available: true,
            last_seen_at: Utc::now(),
        };
        self.presence.insert(agent.agent_id, agent.clone());
        agent
    }

    pub fn upsert_location(&self, agent_id: Uuid, lat: f64, lng: f64) -> AgentPresence {
        let now = Utc::now();
        let mut entry = self.presence.entry(agent_id).or_insert_with(|| AgentPresence {
            agent_id,
            name: String::new(),
            location: GeoPoint { lat, lng },
            available: true,
            last_seen_at: now,
        });
        entry.location = GeoPoint { lat, lng };
        entry.last_seen_at = now;
        entry.clone()
    }

    pub fn set_available(&self, agent_id: Uuid, available: bool) {
        if let Some(mut agent) = self.presence.get_mut(&agent_id) {
            agent.available = available;
        }
    }

    pub fn get(&self, agent_id: Uuid) -> Option<AgentPresence> {
        self.presence.get(&agent_id).map(|a| a.clone())
    }

    pub fn all(&self) -> Vec<AgentPresence> {
        self.presence.iter().map(|a| a.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.presence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presence.is_empty()
    }

    pub fn find_candidates(
        &self,
        origin: &GeoPoint,
        max: usize,
        exclude: &HashSet<Uuid>,
        freshness: Duration,
    ) -> Vec<Candidate> {
        let horizon = Utc::now() - freshness;

        let mut candidates: Vec<Candidate> = self
            .presence
            .iter()
            .filter(|agent| {
                agent.available
                    && agent.last_seen_at >= horizon
                    && !exclude.contains(&agent.agent_id)
            })
            .map(|agent| Candidate {
                distance_km: haversine_km(&agent.location, origin),
                presence: agent.clone(),
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.presence.last_seen_at.cmp(&b.presence.last_seen_at))
        });
        candidates.truncate(max);
        candidates
    }
}
