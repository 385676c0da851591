//! Shared test fixtures: deterministic entropy, mock channels, a scripted
//! sphinx and small constructors for domain values.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::core::outbound::model::{
    AddHtlcCmd, ChannelDesc, ChannelId, ChannelUpdate, DecryptedFailurePacket, FullPaymentTag,
    GraphEdge, HopSharedSecret, OnionPacket, OutgoingHtlc, PacketAndSecrets, PartId, PaymentTag,
    Route,
};
use crate::core::outbound::provider::{
    ChannelHandle, EntropySource, FailureDecryptError, OnionBuildError, SphinxCrypto,
};
use crate::core::tlv::TlvStream;
use crate::primitives::{CltvExpiry, CltvExpiryDelta, Msat, Ppm, ShortChannelId};
use crate::util;

pub fn key(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).expect("nonzero filler is a valid key")
}

pub fn node(byte: u8) -> PublicKey {
    let secp = Secp256k1::signing_only();
    PublicKey::from_secret_key(&secp, &key(byte))
}

pub fn tag(byte: u8) -> FullPaymentTag {
    FullPaymentTag {
        payment_hash: [byte; 32],
        payment_secret: [byte.wrapping_add(100); 32],
        tag: PaymentTag::LocallySent,
    }
}

/// A tag whose payment hash actually matches `preimage`.
pub fn tag_for_preimage(preimage: &[u8; 32]) -> FullPaymentTag {
    FullPaymentTag {
        payment_hash: sha256::Hash::hash(preimage).to_byte_array(),
        payment_secret: [77; 32],
        tag: PaymentTag::LocallySent,
    }
}

pub fn update(scid: u64, base: u64, ppm: u32) -> ChannelUpdate {
    ChannelUpdate {
        short_channel_id: ShortChannelId(scid),
        timestamp: 1,
        enabled: true,
        cltv_expiry_delta: CltvExpiryDelta(40),
        htlc_minimum: Msat(1000),
        htlc_maximum: Msat(100_000_000),
        fee_base: Msat(base),
        fee_proportional: Ppm(ppm),
        signature: vec![0; 64],
    }
}

pub fn edge(scid: u64, from: PublicKey, to: PublicKey, base: u64, ppm: u32) -> GraphEdge {
    GraphEdge {
        desc: ChannelDesc {
            short_channel_id: ShortChannelId(scid),
            from,
            to,
        },
        capacity: Msat(10_000_000),
        update: update(scid, base, ppm),
    }
}

/// A zero-fee route from the sentinel source through the given nodes, last
/// node being the target.
pub fn route_via(nodes: &[PublicKey]) -> Route {
    let mut hops = Vec::new();
    let mut from = util::sentinel_source_node();
    for (i, to) in nodes.iter().enumerate() {
        hops.push(edge(100 + i as u64, from, *to, 0, 0));
        from = *to;
    }
    Route { hops }
}

/// An add-HTLC command with the packet keyed to `onion_key`, enough for
/// part-id bookkeeping in tests.
pub fn mock_add_htlc_cmd(full_tag: FullPaymentTag, onion_key: &SecretKey, amount: Msat) -> AddHtlcCmd {
    AddHtlcCmd {
        full_tag,
        first_amount: amount,
        first_expiry: CltvExpiry(800_144),
        packet_and_secrets: PacketAndSecrets {
            packet: OnionPacket {
                version: 0,
                public_key: util::part_id_for(onion_key),
                payload: vec![],
                hmac: [0; 32],
            },
            shared_secrets: vec![],
        },
        final_payload: TlvStream::new(),
    }
}

// ============================================================================
// Mock channel
// ============================================================================

#[derive(Debug)]
struct MockChannelInner {
    available: Msat,
    max_in_flight: Msat,
    min_sendable: Msat,
    open: bool,
    sleeping: bool,
    outgoing: Vec<OutgoingHtlc>,
    submitted: Vec<AddHtlcCmd>,
}

/// A configurable in-memory channel. Cloning shares state, so tests can
/// hold one handle and hand another to the engine.
#[derive(Debug, Clone)]
pub struct MockChannel {
    id: ChannelId,
    remote: PublicKey,
    inner: Arc<Mutex<MockChannelInner>>,
}

impl MockChannel {
    pub fn new(id_byte: u8, remote: PublicKey) -> Self {
        Self {
            id: ChannelId([id_byte; 32]),
            remote,
            inner: Arc::new(Mutex::new(MockChannelInner {
                available: Msat(1_000_000),
                max_in_flight: Msat(1_000_000),
                min_sendable: Msat(1000),
                open: true,
                sleeping: false,
                outgoing: Vec::new(),
                submitted: Vec::new(),
            })),
        }
    }

    pub fn available(self, amount: Msat) -> Self {
        self.inner.lock().unwrap().available = amount;
        self
    }

    pub fn max_in_flight(self, amount: Msat) -> Self {
        self.inner.lock().unwrap().max_in_flight = amount;
        self
    }

    pub fn min_sendable(self, amount: Msat) -> Self {
        self.inner.lock().unwrap().min_sendable = amount;
        self
    }

    pub fn open(self, open: bool) -> Self {
        self.inner.lock().unwrap().open = open;
        self
    }

    pub fn sleeping(self, sleeping: bool) -> Self {
        self.inner.lock().unwrap().sleeping = sleeping;
        self
    }

    pub fn set_open(&self, open: bool) {
        self.inner.lock().unwrap().open = open;
    }

    pub fn set_sleeping(&self, sleeping: bool) {
        self.inner.lock().unwrap().sleeping = sleeping;
    }

    pub fn push_outgoing(&self, full_tag: FullPaymentTag, part_id: PartId, amount: Msat) {
        self.inner
            .lock()
            .unwrap()
            .outgoing
            .push(OutgoingHtlc { full_tag, part_id, amount });
    }

    pub fn clear_outgoing(&self) {
        self.inner.lock().unwrap().outgoing.clear();
    }

    pub fn submitted(&self) -> Vec<AddHtlcCmd> {
        self.inner.lock().unwrap().submitted.clone()
    }
}

#[async_trait]
impl ChannelHandle for MockChannel {
    fn channel_id(&self) -> ChannelId {
        self.id
    }

    fn remote_node_id(&self) -> PublicKey {
        self.remote
    }

    fn available_for_send(&self) -> Msat {
        self.inner.lock().unwrap().available
    }

    fn max_send_in_flight(&self) -> Msat {
        self.inner.lock().unwrap().max_in_flight
    }

    fn min_sendable(&self) -> Msat {
        self.inner.lock().unwrap().min_sendable
    }

    fn outgoing(&self) -> Vec<OutgoingHtlc> {
        self.inner.lock().unwrap().outgoing.clone()
    }

    fn is_operational_and_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    fn is_operational_and_sleeping(&self) -> bool {
        self.inner.lock().unwrap().sleeping
    }

    async fn submit_add_htlc(&self, cmd: AddHtlcCmd) -> Result<()> {
        self.inner.lock().unwrap().submitted.push(cmd);
        Ok(())
    }
}

// ============================================================================
// Deterministic entropy
// ============================================================================

/// Hands out session keys `[1;32]`, `[2;32]`, ... in order and never
/// shuffles, so assignments are fully predictable.
#[derive(Debug, Default)]
pub struct SeqEntropy {
    counter: AtomicU8,
}

impl EntropySource for SeqEntropy {
    fn fresh_session_key(&self) -> SecretKey {
        let n = self.counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        key(n)
    }

    fn shuffle_candidates(&self, _candidates: &mut [(crate::core::outbound::provider::ChanRef, Msat)]) {}
}

// ============================================================================
// Scripted sphinx
// ============================================================================

#[derive(Default)]
struct MockSphinxInner {
    fail_build: bool,
    decrypts: HashMap<Vec<u8>, DecryptedFailurePacket>,
    bad_sig_nodes: HashSet<PublicKey>,
}

/// Sphinx stand-in: packets are empty shells keyed to the session key,
/// failure decryption is scripted per reason blob, and signatures verify
/// unless a node is marked bad.
#[derive(Default)]
pub struct MockSphinx {
    inner: Mutex<MockSphinxInner>,
}

impl MockSphinx {
    pub fn set_fail_build(&self, fail: bool) {
        self.inner.lock().unwrap().fail_build = fail;
    }

    pub fn script_decrypt(&self, reason: Vec<u8>, packet: DecryptedFailurePacket) {
        self.inner.lock().unwrap().decrypts.insert(reason, packet);
    }

    pub fn mark_bad_signature(&self, node_id: PublicKey) {
        self.inner.lock().unwrap().bad_sig_nodes.insert(node_id);
    }
}

impl SphinxCrypto for MockSphinx {
    fn build_onion(
        &self,
        session_key: &SecretKey,
        hop_nodes: &[PublicKey],
        hop_payloads: &[Vec<u8>],
        _assoc_data: &[u8; 32],
    ) -> std::result::Result<PacketAndSecrets, OnionBuildError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_build {
            return Err(OnionBuildError::PayloadTooLarge {
                size: hop_payloads.iter().map(|p| p.len()).sum(),
                max: 1300,
            });
        }
        Ok(PacketAndSecrets {
            packet: OnionPacket {
                version: 0,
                public_key: util::part_id_for(session_key),
                payload: hop_payloads.concat(),
                hmac: [0; 32],
            },
            shared_secrets: hop_nodes
                .iter()
                .enumerate()
                .map(|(i, node_id)| HopSharedSecret {
                    secret: [i as u8; 32],
                    node_id: *node_id,
                })
                .collect(),
        })
    }

    fn decrypt_failure(
        &self,
        reason: &[u8],
        _shared_secrets: &[HopSharedSecret],
    ) -> std::result::Result<DecryptedFailurePacket, FailureDecryptError> {
        self.inner
            .lock()
            .unwrap()
            .decrypts
            .get(reason)
            .cloned()
            .ok_or(FailureDecryptError::BadMac)
    }

    fn is_node_update_sig_ok(&self, _update: &ChannelUpdate, node_id: &PublicKey) -> bool {
        !self.inner.lock().unwrap().bad_sig_nodes.contains(node_id)
    }
}
