//! Failure Ledger.
//!
//! Process-wide memory of recent routing failures: the amount at which an
//! external channel last failed (restored towards capacity over time),
//! penalty counters for nodes that fail without usable details and for
//! directed edges, and a set of edges declared unroutable until the next
//! reduction cycle. The master owns one instance and consults it when
//! filtering route requests.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bitcoin::secp256k1::PublicKey;
use log::debug;

use crate::core::outbound::model::{ChannelDesc, DescAndCapacity, Direction};
use crate::primitives::Msat;

/// The amount at which a channel most recently failed, and when.
#[derive(Debug, Clone, Copy)]
pub struct ChanFailedAt {
    pub amount: Msat,
    pub stamp: Instant,
}

/// Ignore sets attached to a route request.
#[derive(Debug, Clone, Default)]
pub struct RouteIgnores {
    pub nodes: HashSet<PublicKey>,
    pub channels: HashSet<ChannelDesc>,
    pub directions: HashSet<Direction>,
}

#[derive(Debug, Default)]
pub struct FailureLedger {
    chan_failed_at_amount: HashMap<DescAndCapacity, ChanFailedAt>,
    node_failed_times: HashMap<PublicKey, u32>,
    direction_failed_times: HashMap<Direction, u32>,
    chan_not_routable: HashSet<ChannelDesc>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `dac` failed while carrying `used_now` msat. The stored
    /// amount only ever shrinks; the direction counter always grows.
    pub fn on_channel_failed(&mut self, dac: DescAndCapacity, used_now: Msat, now: Instant) {
        let prev = self
            .chan_failed_at_amount
            .get(&dac)
            .map(|entry| entry.amount)
            .unwrap_or(Msat(u64::MAX));
        let amount = prev.min(used_now);
        self.chan_failed_at_amount
            .insert(dac, ChanFailedAt { amount, stamp: now });
        *self
            .direction_failed_times
            .entry(dac.desc.direction())
            .or_default() += 1;
        debug!("ledger: {} failed at {}", dac.desc.short_channel_id, amount);
    }

    pub fn on_node_failed(&mut self, node_id: PublicKey, increment: u32) {
        let counter = self.node_failed_times.entry(node_id).or_default();
        *counter = counter.saturating_add(increment);
    }

    pub fn on_channel_not_routable(&mut self, desc: ChannelDesc) {
        self.chan_not_routable.insert(desc);
    }

    /// Reduction cycle, run when a new payment asks for a clean slate:
    /// failed-at amounts are restored towards capacity proportionally to
    /// the time since they were recorded, node and direction counters are
    /// halved, and the unroutable set is cleared.
    ///
    /// Surviving entries are re-stamped to `now`, so running the reduction
    /// twice at the same instant does not restore twice.
    pub fn reduce(&mut self, now: Instant, recovery: Duration) {
        self.chan_not_routable.clear();

        self.node_failed_times.retain(|_, times| {
            *times /= 2;
            *times > 0
        });
        self.direction_failed_times.retain(|_, times| {
            *times /= 2;
            *times > 0
        });

        self.chan_failed_at_amount.retain(|dac, entry| {
            let elapsed = now.saturating_duration_since(entry.stamp);
            let ratio = if recovery.is_zero() {
                1.0
            } else {
                elapsed.as_secs_f64() / recovery.as_secs_f64()
            };
            let gap = dac.capacity.saturating_sub(entry.amount);
            let restored = entry
                .amount
                .saturating_add(Msat((gap.msat() as f64 * ratio) as u64));
            if restored >= dac.capacity {
                false
            } else {
                entry.amount = restored;
                entry.stamp = now;
                true
            }
        });
    }

    /// Computes the ignore sets for a route request of `amount` msat given
    /// the current in-flight utilisation snapshot.
    pub fn route_ignores(
        &self,
        amount: Msat,
        used: &HashMap<DescAndCapacity, Msat>,
        max_strange_node_failures: u32,
        max_direction_failures: u32,
    ) -> RouteIgnores {
        let mut channels = self.chan_not_routable.clone();

        // Channels already so loaded that another part of this size would
        // not realistically fit.
        for (dac, used_amount) in used {
            let slack = dac.capacity.saturating_sub(Msat(amount.msat() / 32));
            if used_amount.saturating_add(amount) >= slack {
                channels.insert(dac.desc);
            }
        }

        // Channels whose last failure leaves no headroom for this amount.
        for (dac, entry) in &self.chan_failed_at_amount {
            let used_amount = used.get(dac).copied().unwrap_or(Msat::ZERO);
            let headroom = entry
                .amount
                .saturating_sub(used_amount)
                .saturating_sub(Msat(amount.msat() / 8));
            if headroom <= amount {
                channels.insert(dac.desc);
            }
        }

        let nodes = self
            .node_failed_times
            .iter()
            .filter(|(_, times)| **times >= max_strange_node_failures)
            .map(|(node_id, _)| *node_id)
            .collect();

        let directions = self
            .direction_failed_times
            .iter()
            .filter(|(_, times)| **times >= max_direction_failures)
            .map(|(direction, _)| *direction)
            .collect();

        RouteIgnores {
            nodes,
            channels,
            directions,
        }
    }

    pub fn chan_failed_at(&self, dac: &DescAndCapacity) -> Option<ChanFailedAt> {
        self.chan_failed_at_amount.get(dac).copied()
    }

    pub fn node_failures(&self, node_id: &PublicKey) -> u32 {
        self.node_failed_times.get(node_id).copied().unwrap_or(0)
    }

    pub fn direction_failures(&self, direction: &Direction) -> u32 {
        self.direction_failed_times
            .get(direction)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_not_routable(&self, desc: &ChannelDesc) -> bool {
        self.chan_not_routable.contains(desc)
    }
}
