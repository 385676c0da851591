use serde::{Deserialize, Serialize};

/// A monetary amount in millisatoshi. All engine arithmetic is done on this
/// newtype so satoshi and millisatoshi values cannot be mixed up.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Msat(pub u64);

impl Msat {
    pub const ZERO: Msat = Msat(0);

    /// Constructs a new `Msat` from a raw millisatoshi count.
    pub const fn from_msat(msat: u64) -> Self {
        Msat(msat)
    }

    /// Returns the msat value as `u64`.
    pub const fn msat(&self) -> u64 {
        self.0
    }

    /// Floored satoshi value, e.g. 100678 msat becomes 100 sat.
    pub const fn to_sats_floor(&self) -> u64 {
        self.0 / 1000
    }

    pub fn saturating_add(self, other: Msat) -> Msat {
        Msat(self.0.saturating_add(other.0))
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, other: Msat) -> Msat {
        Msat(self.0.saturating_sub(other.0))
    }

    pub fn checked_sub(self, other: Msat) -> Option<Msat> {
        self.0.checked_sub(other.0).map(Msat)
    }

    pub fn min(self, other: Msat) -> Msat {
        Msat(self.0.min(other.0))
    }

    pub fn max(self, other: Msat) -> Msat {
        Msat(self.0.max(other.0))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl core::ops::Add for Msat {
    type Output = Msat;

    fn add(self, other: Msat) -> Msat {
        Msat(self.0 + other.0)
    }
}

impl core::ops::AddAssign for Msat {
    fn add_assign(&mut self, other: Msat) {
        self.0 += other.0;
    }
}

impl core::iter::Sum for Msat {
    fn sum<I: Iterator<Item = Msat>>(iter: I) -> Msat {
        iter.fold(Msat::ZERO, |acc, a| acc.saturating_add(a))
    }
}

impl core::fmt::Display for Msat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}msat", self.0)
    }
}

/// Proportional fee rate in parts-per-million. Its own type so rates are
/// never confused with absolute amounts and the integer math lives in one
/// place.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ppm(pub u32);

impl Ppm {
    pub const fn from_ppm(value: u32) -> Self {
        Ppm(value)
    }

    /// Applies the proportion to a base amount in msat. Widened to u128 so
    /// large amounts cannot overflow mid-multiplication.
    pub fn apply_to(&self, base: Msat) -> Msat {
        Msat((base.0 as u128 * self.0 as u128 / 1_000_000) as u64)
    }

    pub fn ppm(&self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for Ppm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}ppm", self.0)
    }
}

/// A short channel id, the `(blockHeight, txIndex, outputIndex)` triple
/// packed into a u64 the way the gossip layer carries it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ShortChannelId(pub u64);

impl ShortChannelId {
    pub const fn from_parts(block: u32, tx_index: u32, output_index: u16) -> Self {
        ShortChannelId(
            ((block as u64 & 0xFFFFFF) << 40)
                | ((tx_index as u64 & 0xFFFFFF) << 16)
                | output_index as u64,
        )
    }

    pub const fn block_height(&self) -> u32 {
        (self.0 >> 40) as u32 & 0xFFFFFF
    }

    pub const fn tx_index(&self) -> u32 {
        (self.0 >> 16) as u32 & 0xFFFFFF
    }

    pub const fn output_index(&self) -> u16 {
        self.0 as u16
    }
}

impl From<u64> for ShortChannelId {
    fn from(raw: u64) -> Self {
        ShortChannelId(raw)
    }
}

impl core::fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

/// Absolute block-height timelock on an HTLC.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CltvExpiry(pub u32);

impl CltvExpiry {
    pub const fn height(&self) -> u32 {
        self.0
    }
}

/// Per-hop CLTV delta added on top of a downstream expiry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CltvExpiryDelta(pub u32);

impl core::ops::Add<CltvExpiryDelta> for CltvExpiry {
    type Output = CltvExpiry;

    fn add(self, delta: CltvExpiryDelta) -> CltvExpiry {
        CltvExpiry(self.0 + delta.0)
    }
}

/// The destination expiry of a payment, either pinned to an absolute block
/// height by the invoice or expressed as a delta on top of the current tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainExpiry {
    Absolute(CltvExpiry),
    Delta(CltvExpiryDelta),
}

impl ChainExpiry {
    /// Resolves to an absolute expiry against the given chain tip.
    pub fn resolve(&self, tip: u32) -> CltvExpiry {
        match self {
            ChainExpiry::Absolute(expiry) => *expiry,
            ChainExpiry::Delta(delta) => CltvExpiry(tip) + *delta,
        }
    }
}
