//! Strongly-typed identifiers, positions, and priority classes.

use std::fmt;

/// Integer cell position in a three-dimensional world.
///
/// Spatial fingerprints pack a `CellPos` into 63 bits (21 bits per
/// axis), so only coordinates in `[MIN_COORD, MAX_COORD]` survive a
/// round trip through [`Fingerprint`](crate::Fingerprint).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellPos {
    /// X coordinate.
    pub x: i32,
    /// Y coordinate.
    pub y: i32,
    /// Z coordinate.
    pub z: i32,
}

impl CellPos {
    /// Smallest coordinate representable in a spatial fingerprint.
    pub const MIN_COORD: i32 = -(1 << 20);
    /// Largest coordinate representable in a spatial fingerprint.
    pub const MAX_COORD: i32 = (1 << 20) - 1;

    /// Construct a position.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Position displaced by `(dx, dy, dz)`.
    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x.wrapping_add(dx),
            y: self.y.wrapping_add(dy),
            z: self.z.wrapping_add(dz),
        }
    }

    /// Manhattan (L1) distance to `other`.
    pub fn manhattan(&self, other: &CellPos) -> u64 {
        let dx = (i64::from(self.x) - i64::from(other.x)).unsigned_abs();
        let dy = (i64::from(self.y) - i64::from(other.y)).unsigned_abs();
        let dz = (i64::from(self.z) - i64::from(other.z)).unsigned_abs();
        dx + dy + dz
    }

    /// Whether every axis lies in `[MIN_COORD, MAX_COORD]`.
    pub fn is_packable(&self) -> bool {
        let r = Self::MIN_COORD..=Self::MAX_COORD;
        r.contains(&self.x) && r.contains(&self.y) && r.contains(&self.z)
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

impl From<(i32, i32, i32)> for CellPos {
    fn from((x, y, z): (i32, i32, i32)) -> Self {
        Self { x, y, z }
    }
}

/// Identifies a partition of simulation state (a region or a world).
///
/// Each partition has exactly one owning thread permitted to mutate it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Version (or shape) token of the live state a snapshot was taken from.
///
/// The owning-thread state bumps its token whenever the data a
/// computation depends on changes. The result applier compares the
/// token recorded at capture time with the live one before applying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionToken(pub u64);

impl VersionToken {
    /// The token following this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for VersionToken {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Priority class of a unit of work.
///
/// Ordering is ascending by urgency rank: `Critical < High < Normal < Low`,
/// so sorting ascending yields the order work should be dispatched in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Must run; may evict other queued work.
    Critical,
    /// Player-visible work.
    High,
    /// Default class.
    #[default]
    Normal,
    /// Shed first under load.
    Low,
}

impl Priority {
    /// All priorities in dispatch order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Numeric rank, 0 for `Critical` through 3 for `Low`.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}
