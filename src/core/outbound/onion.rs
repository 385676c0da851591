//! Onion & HTLC command builder.
//!
//! A pure transform from a route plus destination amount, expiry and
//! payload extensions into the command a channel can execute: hop payloads
//! are computed by folding the route right to left, then the sphinx packet
//! is built from a fresh session key with the payment hash as associated
//! data.

use bitcoin::secp256k1::{PublicKey, SecretKey};

use crate::core::outbound::model::{AddHtlcCmd, FullPaymentTag, GraphEdge, Route};
use crate::core::outbound::provider::{OnionBuildError, SphinxCrypto};
use crate::core::tlv::{tu32_bytes, tu64_bytes, TlvStream};
use crate::primitives::{CltvExpiry, Msat};

// Hop payload TLV types.
pub const TLV_AMT_TO_FORWARD: u64 = 2;
pub const TLV_OUTGOING_CLTV: u64 = 4;
pub const TLV_SHORT_CHANNEL_ID: u64 = 6;
pub const TLV_PAYMENT_DATA: u64 = 8;
pub const TLV_PAYMENT_METADATA: u64 = 16;

/// Relay instruction for an intermediate hop: forward `amount` with
/// `expiry` over the given edge.
fn forward_payload(edge: &GraphEdge, amount: Msat, expiry: CltvExpiry) -> TlvStream {
    let mut payload = TlvStream::new();
    payload.insert(TLV_AMT_TO_FORWARD, tu64_bytes(amount.msat()));
    payload.insert(TLV_OUTGOING_CLTV, tu32_bytes(expiry.height()));
    payload.insert(
        TLV_SHORT_CHANNEL_ID,
        edge.desc.short_channel_id.0.to_be_bytes().to_vec(),
    );
    payload
}

/// The destination payload: amount and expiry for this part, the
/// multi-part binding (outer payment secret and total sum), optional payee
/// metadata and whatever TLV extensions the caller attached.
pub fn final_payload(
    amount: Msat,
    total_sum: Msat,
    expiry: CltvExpiry,
    outer_payment_secret: &[u8; 32],
    payee_metadata: Option<&[u8]>,
    onion_tlvs: &TlvStream,
    user_custom_tlvs: &TlvStream,
) -> TlvStream {
    let mut payload = TlvStream::new();
    payload.insert(TLV_AMT_TO_FORWARD, tu64_bytes(amount.msat()));
    payload.insert(TLV_OUTGOING_CLTV, tu32_bytes(expiry.height()));

    let mut payment_data = outer_payment_secret.to_vec();
    payment_data.extend_from_slice(&tu64_bytes(total_sum.msat()));
    payload.insert(TLV_PAYMENT_DATA, payment_data);

    if let Some(metadata) = payee_metadata {
        payload.insert(TLV_PAYMENT_METADATA, metadata.to_vec());
    }
    payload.merge(onion_tlvs);
    payload.merge(user_custom_tlvs);
    payload
}

/// The result of folding a route: what the first hop must receive and the
/// per-hop payloads aligned with the hop nodes.
#[derive(Debug, Clone)]
pub struct FoldedRoute {
    pub first_amount: Msat,
    pub first_expiry: CltvExpiry,
    pub hop_nodes: Vec<PublicKey>,
    pub hop_payloads: Vec<Vec<u8>>,
}

/// Folds hops right to left, accumulating amount and expiry per hop. The
/// first hop is our own channel and charges nothing; every other hop adds
/// its fee and CLTV delta on top of what it must forward.
pub fn fold_route(
    route: &Route,
    final_amount: Msat,
    final_expiry: CltvExpiry,
    final_hop_payload: &TlvStream,
) -> FoldedRoute {
    let mut amount = final_amount;
    let mut expiry = final_expiry;
    let mut hop_payloads = vec![final_hop_payload.to_bytes()];

    for edge in route.hops.iter().skip(1).rev() {
        hop_payloads.insert(0, forward_payload(edge, amount, expiry).to_bytes());
        amount = amount + edge.update.fee_for(amount);
        expiry = expiry + edge.update.cltv_expiry_delta;
    }

    FoldedRoute {
        first_amount: amount,
        first_expiry: expiry,
        hop_nodes: route.hops.iter().map(|edge| edge.desc.to).collect(),
        hop_payloads,
    }
}

/// Builds the complete add-HTLC command for one part.
pub fn build_add_htlc(
    sphinx: &dyn SphinxCrypto,
    onion_key: &SecretKey,
    full_tag: FullPaymentTag,
    route: &Route,
    final_amount: Msat,
    final_expiry: CltvExpiry,
    final_hop_payload: TlvStream,
) -> Result<AddHtlcCmd, OnionBuildError> {
    let folded = fold_route(route, final_amount, final_expiry, &final_hop_payload);
    let packet_and_secrets = sphinx.build_onion(
        onion_key,
        &folded.hop_nodes,
        &folded.hop_payloads,
        &full_tag.payment_hash,
    )?;
    Ok(AddHtlcCmd {
        full_tag,
        first_amount: folded.first_amount,
        first_expiry: folded.first_expiry,
        packet_and_secrets,
        final_payload: final_hop_payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::outbound::testing::{edge, key, node, tag, MockSphinx};
    use crate::primitives::CltvExpiryDelta;
    use crate::util;

    fn two_hop_route(fee_base: u64) -> Route {
        let us = util::sentinel_source_node();
        Route {
            hops: vec![
                edge(1, us, node(10), 0, 0),
                edge(2, node(10), node(20), fee_base, 0),
            ],
        }
    }

    #[test]
    fn test_fold_charges_fees_for_remote_hops_only() {
        let route = two_hop_route(2_000);
        let payload = TlvStream::new();
        let folded = fold_route(&route, Msat(500_000), CltvExpiry(800_144), &payload);

        assert_eq!(folded.first_amount, Msat(502_000));
        assert_eq!(folded.first_expiry, CltvExpiry(800_144) + CltvExpiryDelta(40));
        assert_eq!(folded.hop_nodes, vec![node(10), node(20)]);
        assert_eq!(folded.hop_payloads.len(), 2);
    }

    #[test]
    fn test_fold_direct_route_is_fee_free() {
        let us = util::sentinel_source_node();
        let route = Route {
            hops: vec![edge(1, us, node(10), 5_000, 100)],
        };
        let folded = fold_route(&route, Msat(500_000), CltvExpiry(800_144), &TlvStream::new());
        assert_eq!(folded.first_amount, Msat(500_000));
        assert_eq!(folded.first_expiry, CltvExpiry(800_144));
        assert_eq!(folded.hop_payloads.len(), 1);
    }

    #[test]
    fn test_forward_payload_names_the_edge() {
        let e = edge(0x0102, node(1), node(2), 0, 0);
        let payload = forward_payload(&e, Msat(250_000), CltvExpiry(800_000));
        assert_eq!(payload.get(TLV_AMT_TO_FORWARD), Some(&tu64_bytes(250_000)[..]));
        assert_eq!(payload.get(TLV_OUTGOING_CLTV), Some(&tu32_bytes(800_000)[..]));
        assert_eq!(
            payload.get(TLV_SHORT_CHANNEL_ID),
            Some(&0x0102u64.to_be_bytes()[..])
        );
    }

    #[test]
    fn test_final_payload_binds_the_multipart_total() {
        let secret = [9u8; 32];
        let mut custom = TlvStream::new();
        custom.insert(65537, vec![1, 2, 3]);

        let payload = final_payload(
            Msat(200_000),
            Msat(500_000),
            CltvExpiry(800_144),
            &secret,
            Some(&[0xAB, 0xCD]),
            &TlvStream::new(),
            &custom,
        );

        let mut expected_data = secret.to_vec();
        expected_data.extend_from_slice(&tu64_bytes(500_000));
        assert_eq!(payload.get(TLV_PAYMENT_DATA), Some(&expected_data[..]));
        assert_eq!(payload.get(TLV_PAYMENT_METADATA), Some(&[0xAB, 0xCD][..]));
        assert_eq!(payload.get(65537), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_build_produces_part_keyed_command() {
        let sphinx = MockSphinx::default();
        let onion_key = key(7);
        let route = two_hop_route(2_000);
        let cmd = build_add_htlc(
            &sphinx,
            &onion_key,
            tag(1),
            &route,
            Msat(500_000),
            CltvExpiry(800_144),
            TlvStream::new(),
        )
        .unwrap();

        assert_eq!(cmd.first_amount, Msat(502_000));
        assert_eq!(cmd.part_id(), util::part_id_for(&onion_key));
        assert_eq!(cmd.packet_and_secrets.shared_secrets.len(), 2);
        assert_eq!(
            cmd.packet_and_secrets.shared_secrets[1].node_id,
            node(20)
        );
    }

    #[test]
    fn test_build_surfaces_oversize_payloads() {
        let sphinx = MockSphinx::default();
        sphinx.set_fail_build(true);
        let err = build_add_htlc(
            &sphinx,
            &key(7),
            tag(1),
            &two_hop_route(0),
            Msat(500_000),
            CltvExpiry(800_144),
            TlvStream::new(),
        )
        .unwrap_err();
        assert!(matches!(err, OnionBuildError::PayloadTooLarge { .. }));
    }
}
