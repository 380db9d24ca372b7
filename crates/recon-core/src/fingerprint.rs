//! Deterministic computation keys.
//!
//! Spatial identities pack three coordinates into one 64-bit value,
//! 21 bits per axis in two's complement, laid out as
//! `x << 42 | y << 21 | z`. Composite identities are folded through
//! FNV-1a and finished with a 64-bit avalanche mix.

use std::fmt;

use crate::id::CellPos;

const AXIS_BITS: u32 = 21;
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;
const X_SHIFT: u32 = AXIS_BITS * 2;
const Y_SHIFT: u32 = AXIS_BITS;

/// FNV-1a offset basis for 64-bit.
const FNV_OFFSET: u64 = 0xcbf29ce484222325;
/// FNV-1a prime for 64-bit.
const FNV_PRIME: u64 = 0x00000100000001B3;

// Field tags keep `with_u64(1)` and `with_i64(1)` distinct.
const TAG_U64: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_I32: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_POS: u8 = 6;

/// Pack a position into 63 bits.
///
/// Coordinates outside `[CellPos::MIN_COORD, CellPos::MAX_COORD]`
/// wrap; encoding never fails.
pub fn encode_pos(pos: CellPos) -> u64 {
    let x = (pos.x as u32 as u64) & AXIS_MASK;
    let y = (pos.y as u32 as u64) & AXIS_MASK;
    let z = (pos.z as u32 as u64) & AXIS_MASK;
    (x << X_SHIFT) | (y << Y_SHIFT) | z
}

/// Inverse of [`encode_pos`] for in-range positions.
pub fn decode_pos(bits: u64) -> CellPos {
    CellPos::new(
        sign_extend((bits >> X_SHIFT) & AXIS_MASK),
        sign_extend((bits >> Y_SHIFT) & AXIS_MASK),
        sign_extend(bits & AXIS_MASK),
    )
}

#[inline]
fn sign_extend(field: u64) -> i32 {
    let shift = 64 - AXIS_BITS;
    (((field << shift) as i64) >> shift) as i32
}

#[inline]
fn fnv1a_byte(hash: u64, byte: u8) -> u64 {
    (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
}

#[inline]
fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash = fnv1a_byte(hash, b);
    }
    hash
}

/// Murmur3 `fmix64` finaliser.
#[inline]
fn avalanche(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Opaque key identifying a computation for caching and deduplication.
///
/// The two variants live in disjoint key spaces, so a spatial key can
/// never equal a composite one even when their bits coincide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// A packed [`CellPos`].
    Spatial(u64),
    /// A structural hash, optionally anchored at a position for region
    /// invalidation.
    Composite {
        /// Avalanche-mixed FNV-1a digest of the folded fields.
        digest: u64,
        /// Position used by region queries, if any.
        anchor: Option<CellPos>,
    },
}

impl Fingerprint {
    /// Spatial fingerprint of a single position.
    pub fn spatial(pos: CellPos) -> Self {
        Self::Spatial(encode_pos(pos))
    }

    /// Start building a composite fingerprint.
    pub fn builder() -> FingerprintBuilder {
        FingerprintBuilder::new()
    }

    /// The decoded position of a spatial fingerprint.
    pub fn decode(&self) -> Option<CellPos> {
        match *self {
            Self::Spatial(bits) => Some(decode_pos(bits)),
            Self::Composite { .. } => None,
        }
    }

    /// Position used for region queries: the decoded position of a
    /// spatial key, or the anchor of a composite one.
    pub fn anchor(&self) -> Option<CellPos> {
        match *self {
            Self::Spatial(bits) => Some(decode_pos(bits)),
            Self::Composite { anchor, .. } => anchor,
        }
    }

    /// Raw 64-bit value (packed position or digest).
    pub fn bits(&self) -> u64 {
        match *self {
            Self::Spatial(bits) => bits,
            Self::Composite { digest, .. } => digest,
        }
    }
}

impl From<CellPos> for Fingerprint {
    fn from(pos: CellPos) -> Self {
        Self::spatial(pos)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spatial(bits) => write!(f, "spatial{}", decode_pos(*bits)),
            Self::Composite { digest, .. } => write!(f, "composite:{digest:016x}"),
        }
    }
}

/// Folds tagged fields into a composite [`Fingerprint`].
///
/// Field order is significant. Strings and byte slices are
/// length-prefixed so adjacent fields cannot run into each other.
///
/// ```
/// use recon_core::{CellPos, Fingerprint};
///
/// let a = Fingerprint::builder()
///     .with_str("blast")
///     .with_pos(CellPos::new(4, 64, -9))
///     .with_u64(3)
///     .anchor(CellPos::new(4, 64, -9))
///     .finish();
/// assert_eq!(a.anchor(), Some(CellPos::new(4, 64, -9)));
/// ```
#[derive(Clone, Debug)]
pub struct FingerprintBuilder {
    hash: u64,
    anchor: Option<CellPos>,
}

impl FingerprintBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self {
            hash: FNV_OFFSET,
            anchor: None,
        }
    }

    fn tagged(mut self, tag: u8, bytes: &[u8]) -> Self {
        self.hash = fnv1a_byte(self.hash, tag);
        self.hash = fnv1a_bytes(self.hash, bytes);
        self
    }

    /// Fold an unsigned integer.
    pub fn with_u64(self, v: u64) -> Self {
        self.tagged(TAG_U64, &v.to_le_bytes())
    }

    /// Fold a signed integer.
    pub fn with_i64(self, v: i64) -> Self {
        self.tagged(TAG_I64, &v.to_le_bytes())
    }

    /// Fold a 32-bit signed integer.
    pub fn with_i32(self, v: i32) -> Self {
        self.tagged(TAG_I32, &v.to_le_bytes())
    }

    /// Fold a string.
    pub fn with_str(self, s: &str) -> Self {
        let len = (s.len() as u64).to_le_bytes();
        self.tagged(TAG_STR, &len).tagged(TAG_STR, s.as_bytes())
    }

    /// Fold a byte slice.
    pub fn with_bytes(self, b: &[u8]) -> Self {
        let len = (b.len() as u64).to_le_bytes();
        self.tagged(TAG_BYTES, &len).tagged(TAG_BYTES, b)
    }

    /// Fold a position (full 32-bit coordinates, no packing).
    pub fn with_pos(self, pos: CellPos) -> Self {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&pos.x.to_le_bytes());
        buf[4..8].copy_from_slice(&pos.y.to_le_bytes());
        buf[8..12].copy_from_slice(&pos.z.to_le_bytes());
        self.tagged(TAG_POS, &buf)
    }

    /// Set the anchor used for region invalidation. Not hashed.
    pub fn anchor(mut self, pos: CellPos) -> Self {
        self.anchor = Some(pos);
        self
    }

    /// Finish the fingerprint.
    pub fn finish(self) -> Fingerprint {
        Fingerprint::Composite {
            digest: avalanche(self.hash),
            anchor: self.anchor,
        }
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn coord() -> impl Strategy<Value = i32> {
        CellPos::MIN_COORD..=CellPos::MAX_COORD
    }

    proptest! {
        #[test]
        fn spatial_round_trip(x in coord(), y in coord(), z in coord()) {
            let pos = CellPos::new(x, y, z);
            prop_assert_eq!(decode_pos(encode_pos(pos)), pos);
            prop_assert_eq!(Fingerprint::spatial(pos).decode(), Some(pos));
        }

        #[test]
        fn packed_value_fits_in_63_bits(x in coord(), y in coord(), z in coord()) {
            prop_assert_eq!(encode_pos(CellPos::new(x, y, z)) >> 63, 0);
        }
    }

    #[test]
    fn round_trip_at_range_edges() {
        let edges = [CellPos::MIN_COORD, -1, 0, 1, CellPos::MAX_COORD];
        for &x in &edges {
            for &z in &edges {
                let pos = CellPos::new(x, -x.max(CellPos::MIN_COORD + 1), z);
                assert_eq!(decode_pos(encode_pos(pos)), pos);
            }
        }
    }

    #[test]
    fn out_of_range_wraps_instead_of_failing() {
        let pos = CellPos::new(CellPos::MAX_COORD + 1, 0, 0);
        assert_eq!(decode_pos(encode_pos(pos)).x, CellPos::MIN_COORD);
    }

    #[test]
    fn axes_do_not_alias() {
        let a = Fingerprint::spatial(CellPos::new(1, 0, 0));
        let b = Fingerprint::spatial(CellPos::new(0, 1, 0));
        let c = Fingerprint::spatial(CellPos::new(0, 0, 1));
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn nearby_composite_inputs_rarely_collide() {
        let origin = CellPos::new(120, 64, -300);
        let mut digests = HashSet::new();
        for i in 0..1000 {
            let p = origin.offset(i % 10, (i / 10) % 10, i / 100);
            let fp = Fingerprint::builder().with_pos(p).with_u64(4).finish();
            digests.insert(fp.bits());
        }
        let collisions = 1000 - digests.len();
        assert!(collisions < 50, "{collisions} collisions over 1000 inputs");
    }

    #[test]
    fn nearby_spatial_inputs_never_collide() {
        let mut keys = HashSet::new();
        for i in 0..1000 {
            keys.insert(Fingerprint::spatial(CellPos::new(i % 10, i / 10 % 10, i / 100)));
        }
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn field_order_and_type_are_significant() {
        let a = Fingerprint::builder().with_u64(1).with_u64(2).finish();
        let b = Fingerprint::builder().with_u64(2).with_u64(1).finish();
        assert_ne!(a, b);
        let c = Fingerprint::builder().with_u64(1).finish();
        let d = Fingerprint::builder().with_i64(1).finish();
        assert_ne!(c, d);
        let e = Fingerprint::builder().with_str("ab").with_str("c").finish();
        let f = Fingerprint::builder().with_str("a").with_str("bc").finish();
        assert_ne!(e, f);
    }

    #[test]
    fn spatial_and_composite_are_disjoint() {
        let pos = CellPos::new(3, 4, 5);
        let s = Fingerprint::spatial(pos);
        let c = Fingerprint::Composite {
            digest: s.bits(),
            anchor: Some(pos),
        };
        assert_ne!(s, c);
        assert_eq!(s.anchor(), c.anchor());
    }

    #[test]
    fn builder_is_deterministic() {
        let mk = || {
            Fingerprint::builder()
                .with_str("network")
                .with_pos(CellPos::new(-5, 70, 12))
                .with_bytes(&[1, 2, 3])
                .with_i32(-8)
                .finish()
        };
        assert_eq!(mk(), mk());
        assert_eq!(mk().anchor(), None);
    }
}
