use std::collections::HashSet;

use chrono::{Duration, Utc};
use dashmap::Entry;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::Candidate;
use crate::models::assignment::{Assignment, AssignmentOffer, AssignmentPhase};
use crate::models::order::{ShopOrder, ShopOrderStatus};
use crate::relay::{publish_status_update, Channel, RelayEvent};
use crate::state::AppState;

pub enum RoundOutcome {
    Broadcast {
        assignment: Assignment,
        candidates: Vec<Candidate>,
    },
    NoCandidates { shop_id: Uuid },
    Ineligible,
}

pub enum AcceptOutcome {
    Won(ShopOrder),
    AlreadyYours,
}

enum Opened {
    Round {
        assignment: Assignment,
        offer: AssignmentOffer,
        candidates: Vec<Candidate>,
        superseded: Vec<(Uuid, Vec<Uuid>)>,
    },
    Dry { shop_id: Uuid },
    Ineligible,
}

pub fn open_round(
    state: &AppState,
    order_id: Uuid,
    shop_order_id: Uuid,
    exclude: &mut HashSet<Uuid>,
    round: u32,
) -> Result<RoundOutcome, AppError> {
    let ttl = Duration::seconds(state.config.offer_ttl_secs as i64);
    let freshness = Duration::seconds(state.config.presence_ttl_secs as i64);
    let max = state.config.max_candidates;

    let opened = state.ledger.with_order(order_id, |order| {
        let delivery_address = order.delivery_address.clone();
        let Some(shop_order) = order.shop_orders.iter().find(|s| s.id == shop_order_id)
        else {
            return Err(AppError::NotFound(format!(
                "shop order {shop_order_id} not found in order {order_id}"
            )));
        };

        if shop_order.status != ShopOrderStatus::ReadyForPickup
            || shop_order.assigned_agent.is_some()
        {
            return Ok(Opened::Ineligible);
        }

        let origin = shop_order.shop_location;
        let mut candidates = state.geo.find_candidates(&origin, max, exclude, freshness);
        if candidates.is_empty() && !exclude.is_empty() {
            exclude.clear();
            candidates = state.geo.find_candidates(&origin, max, exclude, freshness);
        }
        if candidates.is_empty() {
            return Ok(Opened::Dry {
                shop_id: shop_order.shop_id,
            });
        }

        let superseded =
            invalidate_open_rounds(state, shop_order_id, AssignmentPhase::Expired, None);

        let now = Utc::now();
        let assignment = Assignment {
            id: Uuid::new_v4(),
            order_id,
            shop_order_id,
            candidates: candidates.iter().map(|c| c.presence.agent_id).collect(),
            winning_agent: None,
            phase: AssignmentPhase::Open,
            round,
            offered_at: now,
            accepted_at: None,
            expires_at: now + ttl,
        };
        let offer = AssignmentOffer {
            assignment_id: assignment.id,
            order_id,
            shop_order_id,
            shop_name: shop_order.shop_name.clone(),
            delivery_address,
            items: shop_order.items.clone(),
            subtotal: shop_order.subtotal,
            expires_at: assignment.expires_at,
        };
        state.assignments.insert(assignment.id, assignment.clone());
        Ok(Opened::Round {
            assignment,
            offer,
            candidates,
            superseded,
        })
    })??;

    match opened {
        Opened::Round {
            assignment,
            offer,
            candidates,
            superseded,
        } => {
            for (closed_id, members) in superseded {
                for member in members {
                    state.relay.publish(
                        Channel::Agent(member),
                        RelayEvent::AssignmentClosed {
                            assignment_id: closed_id,
                        },
                    );
                }
            }
            for candidate in &candidates {
                state.relay.publish(
                    Channel::Agent(candidate.presence.agent_id),
                    RelayEvent::NewAssignment(offer.clone()),
                );
            }
            state.metrics.open_offers.inc();
            info!(
                shop_order_id = %shop_order_id,
                assignment_id = %assignment.id,
                round,
                candidates = candidates.len(),
                "delivery offer broadcast"
            );
            Ok(RoundOutcome::Broadcast {
                assignment,
                candidates,
            })
        }
        Opened::Dry { shop_id } => {
            warn!(shop_order_id = %shop_order_id, round, "no delivery agents in reach");
            Ok(RoundOutcome::NoCandidates { shop_id })
        }
        Opened::Ineligible => Ok(RoundOutcome::Ineligible),
    }
}

pub fn accept(
    state: &AppState,
    assignment_id: Uuid,
    agent_id: Uuid,
) -> Result<AcceptOutcome, AppError> {
    let now = Utc::now();

    let (order_id, shop_order_id, offered_at, candidates) = {
        let mut entry = state.assignments.get_mut(&assignment_id).ok_or_else(|| {
            AppError::NotFound(format!("assignment {assignment_id} not found"))
        })?;

        match entry.phase {
            AssignmentPhase::Won if entry.winning_agent == Some(agent_id) => {
                state
                    .metrics
                    .accept_attempts_total
                    .with_label_values(&["repeat"])
                    .inc();
                return Ok(AcceptOutcome::AlreadyYours);
            }
            AssignmentPhase::Won => {
                state
                    .metrics
                    .accept_attempts_total
                    .with_label_values(&["lost"])
                    .inc();
                return Err(AppError::Conflict(
                    "assignment already accepted by another agent".to_string(),
                ));
            }
            AssignmentPhase::Expired | AssignmentPhase::Cancelled => {
                state
                    .metrics
                    .accept_attempts_total
                    .with_label_values(&["late"])
                    .inc();
                return Err(AppError::Expired("offer is no longer open".to_string()));
            }
            AssignmentPhase::Open => {}
        }

        if !entry.candidates.contains(&agent_id) {
            state
                .metrics
                .accept_attempts_total
                .with_label_values(&["lost"])
                .inc();
            return Err(AppError::Conflict(
                "agent was not offered this assignment".to_string(),
            ));
        }
        if now > entry.expires_at {
            state
                .metrics
                .accept_attempts_total
                .with_label_values(&["late"])
                .inc();
            return Err(AppError::Expired("offer expired".to_string()));
        }

        match state.active_deliveries.entry(agent_id) {
            Entry::Occupied(_) => {
                state
                    .metrics
                    .accept_attempts_total
                    .with_label_values(&["busy"])
                    .inc();
                return Err(AppError::Conflict(
                    "agent already has an active delivery".to_string(),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert((entry.order_id, entry.shop_order_id));
            }
        }

        entry.winning_agent = Some(agent_id);
        entry.phase = AssignmentPhase::Won;
        entry.accepted_at = Some(now);
        (
            entry.order_id,
            entry.shop_order_id,
            entry.offered_at,
            entry.candidates.clone(),
        )
    };

    let committed = state.ledger.with_order(order_id, |order| {
        let Some(shop_order) = order.shop_orders.iter_mut().find(|s| s.id == shop_order_id)
        else {
            return None;
        };
        if shop_order.status != ShopOrderStatus::ReadyForPickup
            || shop_order.assigned_agent.is_some()
        {
            return None;
        }
        shop_order.assigned_agent = Some(agent_id);
        shop_order.apply_status(ShopOrderStatus::OutForDelivery);
        state.geo.set_available(agent_id, false);
        Some(shop_order.clone())
    })?;

    match committed {
        Some(shop_order) => {
            if let Some((_, watcher)) = state.offer_watchers.remove(&shop_order_id) {
                watcher.abort();
            }

            for loser in candidates.iter().filter(|c| **c != agent_id) {
                state.relay.publish(
                    Channel::Agent(*loser),
                    RelayEvent::AssignmentClosed { assignment_id },
                );
            }
            for (closed_id, members) in invalidate_open_rounds(
                state,
                shop_order_id,
                AssignmentPhase::Expired,
                Some(assignment_id),
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

            publish_status_update(&state.relay, order_id, &shop_order);

            state
                .metrics
                .accept_attempts_total
                .with_label_values(&["won"])
                .inc();
            state
                .metrics
                .assignments_total
                .with_label_values(&["won"])
                .inc();
            state.metrics.open_offers.dec();
            let waited = (now - offered_at).num_milliseconds().max(0) as f64 / 1000.0;
            state.metrics.assignment_wait_seconds.observe(waited);

            info!(
                assignment_id = %assignment_id,
                shop_order_id = %shop_order_id,
                agent_id = %agent_id,
                "assignment accepted"
            );
            Ok(AcceptOutcome::Won(shop_order))
        }
        None => {
            if let Some(mut entry) = state.assignments.get_mut(&assignment_id) {
                entry.phase = AssignmentPhase::Cancelled;
                entry.winning_agent = None;
                entry.accepted_at = None;
            }
            state
                .active_deliveries
                .remove_if(&agent_id, |_, active| *active == (order_id, shop_order_id));
            state
                .metrics
                .accept_attempts_total
                .with_label_values(&["late"])
                .inc();
            state
                .metrics
                .assignments_total
                .with_label_values(&["cancelled"])
                .inc();
            state.metrics.open_offers.dec();
            warn!(
                assignment_id = %assignment_id,
                shop_order_id = %shop_order_id,
                agent_id = %agent_id,
                "accept rolled back, shop order no longer awaiting pickup"
            );
            Err(AppError::Expired(
                "shop order is no longer awaiting pickup".to_string(),
            ))
        }
    }
}

pub(crate) fn invalidate_open_rounds(
    state: &AppState,
    shop_order_id: Uuid,
    phase: AssignmentPhase,
    keep: Option<Uuid>,
) -> Vec<(Uuid, Vec<Uuid>)> {
    let outcome = match phase {
        AssignmentPhase::Cancelled => "cancelled",
        _ => "expired",
    };
    let mut closed = Vec::new();
    for mut entry in state.assignments.iter_mut() {
        if entry.shop_order_id != shop_order_id
            || entry.phase != AssignmentPhase::Open
            || Some(entry.id) == keep
        {
            continue;
        }
        entry.phase = phase;
        closed.push((entry.id, entry.candidates.clone()));
        state.metrics.open_offers.dec();
        state
            .metrics
            .assignments_total
            .with_label_values(&[outcome])
            .inc();
    }
    closed
}

pub(crate) fn purge_rounds(state: &AppState, shop_order_id: Uuid) {
    state
        .assignments
        .retain(|_, assignment| assignment.shop_order_id != shop_order_id);
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use chrono::Utc;

    use super::*;
    use crate::config::Config;
    use crate::models::agent::GeoPoint;
    use crate::models::order::{DeliveryAddress, ItemSnapshot, Order, PaymentMethod};

    fn ready_order(shop_location: GeoPoint) -> Order {
        let shop_order = ShopOrder {
            id: Uuid::new_v4(),
            shop_id: Uuid::new_v4(),
            shop_name: "Corner Deli".to_string(),
            shop_location,
            items: vec![ItemSnapshot {
                item_id: Uuid::new_v4(),
                name: "Bagel".to_string(),
                price: 45,
                quantity: 2,
            }],
            subtotal: 90,
            status: ShopOrderStatus::ReadyForPickup,
            assigned_agent: None,
            otp_hash: None,
            otp_expires_at: None,
            otp_attempts_left: 0,
            delivered_at: None,
            version: 2,
            updated_at: Utc::now(),
        };
        Order {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            delivery_address: DeliveryAddress {
                text: "Unter den Linden 5".to_string(),
                location: GeoPoint {
                    lat: 52.517,
                    lng: 13.389,
                },
            },
            payment_method: PaymentMethod::Cod,
            payment_verified: false,
            delivery_fee: 40,
            discount: 0,
            total_amount: 130,
            shop_orders: vec![shop_order],
            created_at: Utc::now(),
        }
    }

    fn state_with_agents(config: Config, count: usize) -> (AppState, Vec<Uuid>) {
        let state = AppState::new(config);
        let mut agents = Vec::new();
        for i in 0..count {
            let id = Uuid::new_v4();
            state
                .geo
                .upsert_location(id, 52.52 + i as f64 * 0.001, 13.40);
            agents.push(id);
        }
        (state, agents)
    }

    fn broadcast_round(state: &AppState, order: &Order) -> Assignment {
        let shop_order_id = order.shop_orders[0].id;
        let mut exclude = HashSet::new();
        match open_round(state, order.id, shop_order_id, &mut exclude, 0).unwrap() {
            RoundOutcome::Broadcast { assignment, .. } => assignment,
            _ => panic!("expected a broadcast round"),
        }
    }

    #[test]
    fn open_round_offers_to_nearest_agents() {
        let mut config = Config::default();
        config.max_candidates = 2;
        let (state, agents) = state_with_agents(config, 4);
        let order = ready_order(GeoPoint {
            lat: 52.52,
            lng: 13.40,
        });
        state.ledger.insert(order.clone());

        let assignment = broadcast_round(&state, &order);
        assert_eq!(assignment.candidates.len(), 2);
        assert_eq!(assignment.candidates[0], agents[0]);
        assert_eq!(assignment.round, 0);
        assert!(state.assignments.contains_key(&assignment.id));
    }

    #[test]
    fn exclusions_are_dropped_rather_than_starving_the_search() {
        let (state, agents) = state_with_agents(Config::default(), 2);
        let order = ready_order(GeoPoint {
            lat: 52.52,
            lng: 13.40,
        });
        state.ledger.insert(order.clone());

        let mut exclude: HashSet<Uuid> = agents.iter().copied().collect();
        let outcome = open_round(
            &state,
            order.id,
            order.shop_orders[0].id,
            &mut exclude,
            1,
        )
        .unwrap();

        match outcome {
            RoundOutcome::Broadcast { assignment, .. } => {
                assert_eq!(assignment.candidates.len(), 2);
            }
            _ => panic!("expected the exclusion reset to rescue the round"),
        }
        assert!(exclude.is_empty());
    }

    #[test]
    fn round_is_not_opened_for_a_shop_order_that_moved_on() {
        let (state, _) = state_with_agents(Config::default(), 2);
        let order = ready_order(GeoPoint {
            lat: 52.52,
            lng: 13.40,
        });
        let shop_order_id = order.shop_orders[0].id;
        state.ledger.insert(order.clone());
        state
            .ledger
            .transition(order.id, shop_order_id, ShopOrderStatus::Cancelled)
            .unwrap();

        let mut exclude = HashSet::new();
        let outcome = open_round(&state, order.id, shop_order_id, &mut exclude, 0).unwrap();
        assert!(matches!(outcome, RoundOutcome::Ineligible));
        assert!(state.assignments.is_empty());
    }

    #[test]
    fn concurrent_accepts_produce_exactly_one_winner() {
        let (state, agents) = state_with_agents(Config::default(), 5);
        let order = ready_order(GeoPoint {
            lat: 52.52,
            lng: 13.40,
        });
        state.ledger.insert(order.clone());
        let assignment = broadcast_round(&state, &order);

        let state = Arc::new(state);
        let barrier = Arc::new(Barrier::new(agents.len()));
        let mut handles = Vec::new();
        for agent_id in agents.clone() {
            let state = Arc::clone(&state);
            let barrier = Arc::clone(&barrier);
            let assignment_id = assignment.id;
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                accept(&state, assignment_id, agent_id)
                    .map(|outcome| (agent_id, outcome))
            }));
        }

        let mut winners = Vec::new();
        let mut conflicts = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok((agent_id, AcceptOutcome::Won(_))) => winners.push(agent_id),
                Ok((_, AcceptOutcome::AlreadyYours)) => panic!("no retries in this test"),
                Err(AppError::Conflict(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts, agents.len() - 1);

        let winner = winners[0];
        let shop_order = state
            .ledger
            .shop_order(order.id, order.shop_orders[0].id)
            .unwrap();
        assert_eq!(shop_order.status, ShopOrderStatus::OutForDelivery);
        assert_eq!(shop_order.assigned_agent, Some(winner));
        assert!(!state.geo.get(winner).unwrap().available);
        assert_eq!(
            state.active_deliveries.get(&winner).map(|e| *e.value()),
            Some((order.id, order.shop_orders[0].id))
        );

        assert!(matches!(
            accept(&state, assignment.id, winner),
            Ok(AcceptOutcome::AlreadyYours)
        ));
    }

    #[test]
    fn accept_after_the_offer_lapsed_is_refused() {
        let mut config = Config::default();
        config.offer_ttl_secs = 0;
        let (state, agents) = state_with_agents(config, 1);
        let order = ready_order(GeoPoint {
            lat: 52.52,
            lng: 13.40,
        });
        state.ledger.insert(order.clone());
        let assignment = broadcast_round(&state, &order);

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(matches!(
            accept(&state, assignment.id, agents[0]),
            Err(AppError::Expired(_))
        ));
        assert_eq!(
            state.assignments.get(&assignment.id).unwrap().phase,
            AssignmentPhase::Open
        );
    }

    #[test]
    fn accept_rolls_back_when_the_shop_order_was_cancelled_meanwhile() {
        let (state, agents) = state_with_agents(Config::default(), 1);
        let order = ready_order(GeoPoint {
            lat: 52.52,
            lng: 13.40,
        });
        let shop_order_id = order.shop_orders[0].id;
        state.ledger.insert(order.clone());
        let assignment = broadcast_round(&state, &order);

        state
            .ledger
            .transition(order.id, shop_order_id, ShopOrderStatus::Cancelled)
            .unwrap();

        assert!(matches!(
            accept(&state, assignment.id, agents[0]),
            Err(AppError::Expired(_))
        ));
        let stored = state.assignments.get(&assignment.id).unwrap();
        assert_eq!(stored.phase, AssignmentPhase::Cancelled);
        assert_eq!(stored.winning_agent, None);
        assert!(state.geo.get(agents[0]).unwrap().available);
        assert!(state.active_deliveries.get(&agents[0]).is_none());
    }

    #[test]
    fn an_agent_cannot_carry_two_deliveries_at_once() {
        let (state, agents) = state_with_agents(Config::default(), 1);
        let agent = agents[0];
        let first = ready_order(GeoPoint {
            lat: 52.52,
            lng: 13.40,
        });
        let second = ready_order(GeoPoint {
            lat: 52.521,
            lng: 13.401,
        });
        state.ledger.insert(first.clone());
        state.ledger.insert(second.clone());
        let first_round = broadcast_round(&state, &first);
        let second_round = broadcast_round(&state, &second);

        assert!(matches!(
            accept(&state, first_round.id, agent),
            Ok(AcceptOutcome::Won(_))
        ));
        assert!(matches!(
            accept(&state, second_round.id, agent),
            Err(AppError::Conflict(_))
        ));

        assert_eq!(
            state.active_deliveries.get(&agent).map(|e| *e.value()),
            Some((first.id, first.shop_orders[0].id))
        );
        {
            let untouched = state.assignments.get(&second_round.id).unwrap();
            assert_eq!(untouched.phase, AssignmentPhase::Open);
            assert_eq!(untouched.winning_agent, None);
        }
        assert_eq!(
            state
                .ledger
                .shop_order_status(second.id, second.shop_orders[0].id)
                .unwrap(),
            ShopOrderStatus::ReadyForPickup
        );

        state.active_deliveries.remove(&agent);
        state.geo.set_available(agent, true);
        assert!(matches!(
            accept(&state, second_round.id, agent),
            Ok(AcceptOutcome::Won(_))
        ));
    }

    #[test]
    fn outsiders_cannot_accept_an_offer() {
        let (state, _) = state_with_agents(Config::default(), 1);
        let order = ready_order(GeoPoint {
            lat: 52.52,
            lng: 13.40,
        });
        state.ledger.insert(order.clone());
        let assignment = broadcast_round(&state, &order);

        assert!(matches!(
            accept(&state, assignment.id, Uuid::new_v4()),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn purged_rounds_vanish_from_lookup() {
        let (state, _) = state_with_agents(Config::default(), 1);
        let order = ready_order(GeoPoint {
            lat: 52.52,
            lng: 13.40,
        });
        state.ledger.insert(order.clone());
        let assignment = broadcast_round(&state, &order);

        purge_rounds(&state, order.shop_orders[0].id);
        assert!(matches!(
            accept(&state, assignment.id, Uuid::new_v4()),
            Err(AppError::NotFound(_))
        ));
    }
}
