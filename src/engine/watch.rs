use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::broker::{self, RoundOutcome};
use crate::models::assignment::AssignmentPhase;
use crate::models::order::ShopOrderStatus;
use crate::relay::{Channel, RelayEvent};
use crate::state::AppState;

#[derive(Debug, Clone, Copy)]
pub enum WatchPlan {
    AwaitExpiry {
        assignment_id: Uuid,
        until: DateTime<Utc>,
    },
    Backoff { attempt: u32 },
}

pub fn spawn_offer_watch(
    state: &Arc<AppState>,
    order_id: Uuid,
    shop_order_id: Uuid,
    plan: WatchPlan,
    next_round: u32,
) {
    let task_state = Arc::clone(state);
    let task = tokio::spawn(run_offer_watch(
        task_state,
        order_id,
        shop_order_id,
        plan,
        next_round,
    ));
    if let Some(previous) = state.offer_watchers.insert(shop_order_id, task.abort_handle()) {
        previous.abort();
    }
}

async fn run_offer_watch(
    state: Arc<AppState>,
    order_id: Uuid,
    shop_order_id: Uuid,
    mut plan: WatchPlan,
    mut next_round: u32,
) {
    let mut exclude: HashSet<Uuid> = HashSet::new();

    loop {
        let pause = match plan {
            WatchPlan::AwaitExpiry { until, .. } => (until - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            WatchPlan::Backoff { attempt } => backoff_delay(&state.config, attempt),
        };
        tokio::time::sleep(pause).await;

        match state.ledger.shop_order_status(order_id, shop_order_id) {
            Ok(ShopOrderStatus::ReadyForPickup) => {}
            _ => break,
        }

        if let WatchPlan::AwaitExpiry { assignment_id, .. } = plan {
            expire_round(&state, assignment_id, &mut exclude);
        }

        match broker::open_round(&state, order_id, shop_order_id, &mut exclude, next_round) {
            Ok(RoundOutcome::Broadcast { assignment, .. }) => {
                next_round += 1;
                plan = WatchPlan::AwaitExpiry {
                    assignment_id: assignment.id,
                    until: assignment.expires_at,
                };
            }
            Ok(RoundOutcome::NoCandidates { shop_id }) => {
                let attempt = match plan {
                    WatchPlan::Backoff { attempt } => attempt.saturating_add(1),
                    WatchPlan::AwaitExpiry { .. } => 0,
                };
                let searching = RelayEvent::AgentSearching {
                    order_id,
                    shop_order_id,
                    attempt,
                };
                state
                    .relay
                    .publish(Channel::Order(order_id), searching.clone());
                state.relay.publish(Channel::Shop(shop_id), searching);
                plan = WatchPlan::Backoff { attempt };
            }
            Ok(RoundOutcome::Ineligible) | Err(_) => break,
        }
    }

    state
        .offer_watchers
        .remove_if(&shop_order_id, |_, handle| handle.id() == tokio::task::id());
}

fn expire_round(state: &AppState, assignment_id: Uuid, exclude: &mut HashSet<Uuid>) {
    let lapsed = state.assignments.get_mut(&assignment_id).and_then(|mut entry| {
        if entry.phase == AssignmentPhase::Open {
            entry.phase = AssignmentPhase::Expired;
            Some(entry.candidates.clone())
        } else {
            None
        }
    });

    let Some(members) = lapsed else { return };

    exclude.extend(members.iter().copied());
    state.metrics.open_offers.dec();
    state
        .metrics
        .assignments_total
        .with_label_values(&["expired"])
        .inc();
    for member in members {
        state.relay.publish(
            Channel::Agent(member),
            RelayEvent::AssignmentClosed { assignment_id },
        );
    }
    info!(assignment_id = %assignment_id, "delivery offer lapsed");
}

pub(crate) fn backoff_delay(config: &Config, attempt: u32) -> Duration {
    let doubled = config
        .search_backoff_base_ms
        .saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(doubled.min(config.search_backoff_cap_ms))
}
