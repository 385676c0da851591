//! Sendable Calculator.
//!
//! Pure functions answering two questions: how much can each channel carry
//! for a new part right now, and how much of every external channel is
//! already taken by routed in-flight parts.

use std::collections::{HashMap, HashSet};

use crate::core::outbound::model::{DescAndCapacity, PartId, PartStatus};
use crate::core::outbound::provider::ChanRef;
use crate::primitives::Msat;

/// Per-channel amount currently sendable, after subtracting the fee budget
/// and every part that is reserved against the channel but not yet
/// reflected in the channel's own outgoing set. Channels below their
/// minimum sendable are excluded, as are channels that are not operational
/// and open.
///
/// A part counts as reserved from the moment a channel is picked for it;
/// once the channel acknowledges the HTLC (it shows up in `outgoing`), the
/// channel's `available_for_send` already covers it and it must not be
/// subtracted twice.
pub fn right_now_sendable(
    chans: &[ChanRef],
    max_fee: Msat,
    parts: &HashMap<PartId, PartStatus>,
) -> Vec<(ChanRef, Msat)> {
    let mut out = Vec::new();
    for chan in chans {
        if !chan.is_operational_and_open() {
            continue;
        }
        let acked: HashSet<PartId> = chan.outgoing().iter().map(|h| h.part_id).collect();
        let reserved: Msat = parts
            .iter()
            .filter_map(|(part_id, part)| match part {
                PartStatus::WaitForRouteOrInFlight { chan: c, amount, .. }
                    if c.channel_id() == chan.channel_id() && !acked.contains(part_id) =>
                {
                    Some(*amount)
                }
                _ => None,
            })
            .sum();

        let headroom = chan.max_send_in_flight().min(chan.available_for_send());
        let sendable = headroom.saturating_sub(max_fee).saturating_sub(reserved);
        if sendable >= chan.min_sendable() && !sendable.is_zero() {
            out.push((chan.clone(), sendable));
        }
    }
    out
}

/// Total amount the currently sleeping channels could carry once they come
/// back online. Used to decide whether parking a part and waiting beats
/// failing outright.
pub fn sleeping_sendable(chans: &[ChanRef], max_fee: Msat) -> Msat {
    chans
        .iter()
        .filter(|chan| chan.is_operational_and_sleeping())
        .map(|chan| {
            let headroom = chan.max_send_in_flight().min(chan.available_for_send());
            let sendable = headroom.saturating_sub(max_fee);
            if sendable >= chan.min_sendable() {
                sendable
            } else {
                Msat::ZERO
            }
        })
        .sum()
}

/// Best-effort snapshot of external-channel utilisation: for every routed
/// in-flight part, its amount is charged to every hop of its route. The
/// master feeds this into route-request filtering so the path-finder does
/// not pile parts onto edges that are already carrying them.
pub fn used_capacities<'a>(
    parts: impl Iterator<Item = &'a PartStatus>,
) -> HashMap<DescAndCapacity, Msat> {
    let mut used: HashMap<DescAndCapacity, Msat> = HashMap::new();
    for part in parts {
        if let Some(flight) = part.flight() {
            for edge in &flight.route.hops {
                *used.entry(edge.desc_and_capacity()).or_default() += part.amount();
            }
        }
    }
    used
}
