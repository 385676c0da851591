use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

/// Derives the part id for an onion session key. A part is identified by
/// the public key of its session keypair, so rotating the key on a remote
/// retry yields a fresh part id.
pub fn part_id_for(onion_key: &SecretKey) -> PublicKey {
    let secp = Secp256k1::signing_only();
    PublicKey::from_secret_key(&secp, onion_key)
}

/// Stand-in source node id used in route requests. Routes are requested on
/// behalf of a channel peer through a fabricated local edge, so the real
/// source key never leaves this process.
pub fn sentinel_source_node() -> PublicKey {
    let secp = Secp256k1::signing_only();
    let key = SecretKey::from_slice(&[0x01; 32]).expect("static key is within curve order");
    PublicKey::from_secret_key(&secp, &key)
}

/// Checks a claimed preimage against a payment hash.
pub fn preimage_matches(preimage: &[u8; 32], payment_hash: &[u8; 32]) -> bool {
    sha256::Hash::hash(preimage).to_byte_array() == *payment_hash
}
