use bitvec::prelude::*;
use glam::Vec3;
use std::ops::Range;

use crate::Cube;

/// 64 bit path from the root of an octree down to a cell at most
/// 19 levels deep (the root itself is depth 0 and has no index).
/// ```text
/// Bit layout
/// 00101 00 000 000 ... 000 000 001 101 100 000 001
///   |    |  19  18      7   6   5   4   3   2   1
///   |    |  |   |       |   |   |   |   |   |   |
///   |    |  |   |       |   |   -----------------Octant indices
///   |    |  -----------------(000 past the depth)
///   |    ---------Padding (always 0)
///   --Depth
///
/// Bits 0-2, 3-5, ..., 54-56: Octant indices
/// The octant taken at each level, shallowest first. Every index
/// past the depth MUST be 000.
///
/// Bits 57-58: Padding
///
/// Bits 59-63: Depth
/// Number of octant indices that are valid.
/// ```
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OctantKey(u64);

impl OctantKey {
    pub const MAX_DEPTH: u8 = 19;

    const DEPTH_BITS_RANGE: Range<usize> = 59..64;
    const PADDING_BITS_RANGE: Range<usize> = 57..59;
    const OCTANT_BITS_RANGE: Range<usize> = 0..57;
    const OCTANT_INDEX_SIZE: usize = 3;

    /// Descends from `root` towards `point`, recording the octant taken
    /// at each level, until `depth` levels have been recorded.
    pub fn locate(root: &Cube, point: Vec3, depth: u8) -> Self {
        let depth = depth.min(Self::MAX_DEPTH);
        let mut key = Self::default();
        let mut cube = *root;
        while key.depth() < depth {
            let octant = cube.octant(point);
            key.push(octant);
            cube = cube.child(octant);
        }
        key
    }

    pub fn depth(&self) -> u8 {
        self.0.view_bits::<Lsb0>()[Self::DEPTH_BITS_RANGE].load()
    }

    fn octant_bits(level: u8) -> Range<usize> {
        let start = Self::OCTANT_INDEX_SIZE * (level as usize - 1);
        start..start + Self::OCTANT_INDEX_SIZE
    }

    /// Octant taken when stepping from `level - 1` to `level`.
    pub fn octant_at(&self, level: u8) -> u8 {
        assert!(level > 0 && level <= self.depth(), "level {level} outside key of depth {}", self.depth());

        self.0.view_bits::<Lsb0>()
            [Self::OCTANT_BITS_RANGE]
            [Self::octant_bits(level)]
            .load()
    }

    #[inline(always)]
    pub fn at_max_depth(&self) -> bool {
        self.depth() == Self::MAX_DEPTH
    }

    pub fn push(&mut self, octant: u8) {
        assert!(!self.at_max_depth(), "OctantKey overflow");
        assert!(octant < 8);
        debug_assert!(self.0.view_bits::<Lsb0>()[Self::PADDING_BITS_RANGE].not_any());

        let depth = self.depth() + 1;
        let bits = self.0.view_bits_mut::<Lsb0>();
        bits[Self::DEPTH_BITS_RANGE].store(depth);
        bits[Self::OCTANT_BITS_RANGE][Self::octant_bits(depth)].store(octant);
    }

    pub fn pop(&mut self) -> u8 {
        let depth = self.depth();
        assert!(depth > 0, "pop on empty OctantKey");

        let octant = self.octant_at(depth);
        let bits = self.0.view_bits_mut::<Lsb0>();
        bits[Self::OCTANT_BITS_RANGE][Self::octant_bits(depth)].fill(false);
        bits[Self::DEPTH_BITS_RANGE].store(depth - 1);
        octant
    }

    /// Octants from the root downwards.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=self.depth()).map(|level| self.octant_at(level))
    }

    #[cfg(test)]
    fn sanity_check(&self) {
        let bits = self.0.view_bits::<Lsb0>();
        let depth = self.depth() as usize;
        assert!(depth <= Self::MAX_DEPTH as usize);
        assert!(bits[Self::PADDING_BITS_RANGE].not_any());
        assert!(bits[Self::OCTANT_BITS_RANGE][Self::OCTANT_INDEX_SIZE * depth..].not_any());
    }
}

#[test]
fn octant_key_push_pop_test() {
    let mut key = OctantKey::default();
    key.sanity_check();
    assert_eq!(key.depth(), 0);

    key.push(4);
    key.sanity_check();
    assert_eq!(key.0, 0b0000100000000000000000000000000000000000000000000000000000000100);

    key.push(7);
    key.sanity_check();
    assert_eq!(key.0, 0b0001000000000000000000000000000000000000000000000000000000111100);
    assert_eq!(key.iter().collect::<Vec<_>>(), vec![4, 7]);

    assert_eq!(key.pop(), 7);
    key.sanity_check();
    assert_eq!(key.octant_at(1), 4);
    assert_eq!(key.0, 0b0000100000000000000000000000000000000000000000000000000000000100);
}

#[test]
fn octant_key_locate_test() {
    use glam::vec3;

    let root = Cube::from_radius(Vec3::ZERO, 8.0);
    let key = OctantKey::locate(&root, vec3(5.0, -1.0, 0.0), 3);
    key.sanity_check();

    // x: 5 > 0, 5 > 4, 5 <= 6
    // y: -1 <= 0, -1 > -4, -1 > -2
    // z: 0 <= 0, 0 > -4, 0 > -2
    assert_eq!(key.iter().collect::<Vec<_>>(), vec![0b100, 0b111, 0b011]);

    let deepest = OctantKey::locate(&root, vec3(5.0, -1.0, 0.0), 200);
    assert!(deepest.at_max_depth());
    deepest.sanity_check();
}
