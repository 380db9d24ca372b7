//! Test fixtures and mock strategies for recon development.
//!
//! [`GridWorld`] is a small versioned voxel world that plays the part of
//! owning-thread state. [`NetworkScan`] is a subsystem over it whose
//! computation sums a cell and its six face neighbours, with strategy
//! implementations in [`fixtures`] covering fast, slow, gated, failing
//! and panicking workers.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use std::collections::HashMap;

use recon_core::{CellPos, VersionToken};

pub use fixtures::{
    CallCounter, FailingComputation, Gate, GatedComputation, GridApplier, GridSource,
    NetworkScan, PanickingComputation, ScanSnapshot, SlowComputation, SumComputation,
};

/// One cell of a [`GridWorld`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cell {
    pub value: u32,
    pub version: VersionToken,
}

/// Versioned voxel world.
///
/// Every write bumps the written cell's version and the versions of its
/// face neighbours, since their neighbourhood sums depend on it.
#[derive(Clone, Debug, Default)]
pub struct GridWorld {
    cells: HashMap<CellPos, Cell>,
    applied: HashMap<CellPos, u64>,
    applies: u64,
}

impl GridWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cube of side `2 * half + 1` centred on the origin, every cell
    /// holding `value`.
    pub fn cube(half: i32, value: u32) -> Self {
        let mut world = Self::new();
        for x in -half..=half {
            for y in -half..=half {
                for z in -half..=half {
                    world.cells.insert(
                        CellPos::new(x, y, z),
                        Cell {
                            value,
                            version: VersionToken(1),
                        },
                    );
                }
            }
        }
        world
    }

    pub fn get(&self, pos: CellPos) -> Option<&Cell> {
        self.cells.get(&pos)
    }

    pub fn version(&self, pos: CellPos) -> Option<VersionToken> {
        self.cells.get(&pos).map(|c| c.version)
    }

    /// Write `value` at `pos`, creating the cell if needed.
    pub fn set(&mut self, pos: CellPos, value: u32) {
        let cell = self.cells.entry(pos).or_insert(Cell {
            value,
            version: VersionToken(0),
        });
        cell.value = value;
        self.touch_around(pos);
    }

    /// Remove the cell at `pos`.
    pub fn remove(&mut self, pos: CellPos) -> Option<Cell> {
        let removed = self.cells.remove(&pos);
        if removed.is_some() {
            self.applied.remove(&pos);
            self.touch_around(pos);
        }
        removed
    }

    /// Bump the version of `pos` without changing its value.
    pub fn touch(&mut self, pos: CellPos) {
        if let Some(cell) = self.cells.get_mut(&pos) {
            cell.version = cell.version.next();
        }
    }

    fn touch_around(&mut self, pos: CellPos) {
        for p in neighbourhood(pos) {
            self.touch(p);
        }
    }

    /// Sum of `pos` and its face neighbours, as the computation sees it.
    pub fn neighbourhood_sum(&self, pos: CellPos) -> u64 {
        neighbourhood(pos)
            .filter_map(|p| self.cells.get(&p))
            .map(|c| u64::from(c.value))
            .sum()
    }

    /// The last output applied at `pos`.
    pub fn applied(&self, pos: CellPos) -> Option<u64> {
        self.applied.get(&pos).copied()
    }

    /// Total number of applies performed.
    pub fn apply_count(&self) -> u64 {
        self.applies
    }

    pub(crate) fn record_apply(&mut self, pos: CellPos, output: u64) {
        self.applied.insert(pos, output);
        self.applies += 1;
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// `pos` followed by its six face neighbours.
pub fn neighbourhood(pos: CellPos) -> impl Iterator<Item = CellPos> {
    [
        (0, 0, 0),
        (1, 0, 0),
        (-1, 0, 0),
        (0, 1, 0),
        (0, -1, 0),
        (0, 0, 1),
        (0, 0, -1),
    ]
    .into_iter()
    .map(move |(dx, dy, dz)| pos.offset(dx, dy, dz))
}
