use bitvec::prelude::*;
use log::{ debug, warn };
use std::{
    sync::{ Arc, atomic::{ AtomicBool, Ordering } },
    time::{ Duration, Instant },
};

#[cfg(feature = "multi-thread")]
use rayon::prelude::*;

use crate::{
    octree::{ Octree, NodeId, OctantKey },
    utils::timed,
    BuildError, VoxelSnapshot, VoxelSource,
};

/// Voxels classified per task before the cancel token is checked again.
const CLASSIFY_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildConfig {
    /// A leaf holding more voxels than this is subdivided.
    pub max_per_cell: u32,
    /// Leaves at this depth never subdivide, whatever they hold.
    pub max_depth: u8,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_per_cell: 8,
            max_depth: OctantKey::MAX_DEPTH,
        }
    }
}

impl BuildConfig {
    pub fn new(max_per_cell: u32) -> Self {
        Self {
            max_per_cell,
            ..Default::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: u8) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        if self.max_per_cell == 0 {
            return Err(BuildError::InvalidConfig("max_per_cell must be at least 1"));
        }
        if self.max_depth > OctantKey::MAX_DEPTH {
            return Err(BuildError::InvalidConfig("max_depth must not exceed 19"));
        }
        Ok(())
    }
}

/// Shared flag that asks a running build to stop early.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildStats {
    pub accepted: usize,
    pub dropped: usize,
    pub subdivisions: u32,
    pub node_count: usize,
    pub elapsed: Duration,
}

type Entry = (u32, OctantKey);

/// Builds an octree for a whole voxel snapshot in two phases.
///
/// First every voxel is located independently: it is tested against the
/// root bound and its path of octants is recorded down to the maximum
/// depth. This is the parallel part and touches no shared state. The
/// tree is then assembled on one thread by partitioning those paths,
/// splitting any cell that holds more than `max_per_cell` voxels.
///
/// A cell splits exactly when more voxels than the capacity fall inside
/// it, so the result does not depend on scheduling and matches inserting
/// the voxels one by one with an [`IncrementalBuilder`].
#[derive(Debug, Clone, Default)]
pub struct OctreeBuilder {
    config: BuildConfig,
    cancel: Option<CancelToken>,
}

impl OctreeBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> BuildConfig {
        self.config
    }

    fn check_cancelled(&self) -> Result<(), BuildError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(BuildError::Cancelled),
            _ => Ok(()),
        }
    }

    pub fn build_from_source<S: VoxelSource + ?Sized>(&self, source: &mut S) -> Result<(Octree, BuildStats), BuildError> {
        let snapshot = source.voxel_snapshot();
        self.build(&snapshot)
    }

    pub fn build(&self, snapshot: &VoxelSnapshot) -> Result<(Octree, BuildStats), BuildError> {
        let start = Instant::now();
        let mut tree = Octree::new(snapshot, self.config)?;

        let entries = timed!(self.classify(snapshot)?, "octree voxel classification");
        let dropped = snapshot.count() - entries.len();
        if dropped > 0 {
            warn!("dropped {dropped} of {} voxels outside the octree bound {:?}", snapshot.count(), snapshot.bound);
        }

        let accepted = entries.len();
        self.check_cancelled()?;
        timed!(self.assemble(&mut tree, NodeId::ROOT, entries), "octree assembly");

        let stats = BuildStats {
            accepted,
            dropped,
            subdivisions: tree.subdivisions(),
            node_count: tree.node_count(),
            elapsed: start.elapsed(),
        };
        debug!(
            "built octree: {} voxels, {} nodes, {:.2}MB, {:?}",
            stats.accepted,
            stats.node_count,
            tree.memory_usage() as f32 / 1_000_000.0,
            stats.elapsed,
        );

        Ok((tree, stats))
    }

    fn classify_chunk(&self, snapshot: &VoxelSnapshot, chunk: usize) -> Result<Vec<Entry>, BuildError> {
        self.check_cancelled()?;

        let first = chunk * CLASSIFY_CHUNK;
        let last = (first + CLASSIFY_CHUNK).min(snapshot.count());
        let bound = snapshot.bound;
        let depth = self.config.max_depth;

        Ok(snapshot.voxels[first..last].iter()
            .zip(first as u32..)
            .filter_map(|(voxel, index)| {
                let point = voxel.position();
                bound.contains(point).then(|| (index, OctantKey::locate(&bound, point, depth)))
            })
            .collect())
    }

    /// Keeps input order, which keeps leaf contents in input order.
    fn classify(&self, snapshot: &VoxelSnapshot) -> Result<Vec<Entry>, BuildError> {
        let chunks = (snapshot.count() + CLASSIFY_CHUNK - 1) / CLASSIFY_CHUNK;

        #[cfg(feature = "multi-thread")]
        let located: Vec<Vec<Entry>> = (0..chunks).into_par_iter()
            .map(|chunk| self.classify_chunk(snapshot, chunk))
            .collect::<Result<_, _>>()?;

        #[cfg(not(feature = "multi-thread"))]
        let located: Vec<Vec<Entry>> = (0..chunks)
            .map(|chunk| self.classify_chunk(snapshot, chunk))
            .collect::<Result<_, _>>()?;

        Ok(located.into_iter().flatten().collect())
    }

    fn assemble(&self, tree: &mut Octree, id: NodeId, entries: Vec<Entry>) {
        let depth = tree.node(id).depth();
        if entries.len() <= self.config.max_per_cell as usize || depth >= self.config.max_depth {
            tree.set_leaf_voxels(id, entries.into_iter().map(|(index, _)| index).collect());
            return;
        }

        let children = tree.subdivide(id);
        let mut octants: [Vec<Entry>; 8] = Default::default();
        for entry in entries {
            octants[entry.1.octant_at(depth + 1) as usize].push(entry);
        }

        for (child, entries) in children.into_iter().zip(octants) {
            self.assemble(tree, child, entries);
        }
    }
}

/// Indexes a snapshot with the default depth limit.
pub fn build_octree(snapshot: &VoxelSnapshot, max_per_cell: u32) -> Result<Octree, BuildError> {
    OctreeBuilder::new(BuildConfig::new(max_per_cell))
        .build(snapshot)
        .map(|(tree, _)| tree)
}

/// Indexes the voxels of a snapshot one at a time, in any order.
///
/// Each voxel is referenced by at most one leaf: inserting an index twice
/// is refused. The tree is only handed out by [`IncrementalBuilder::finish`],
/// after which it can no longer change.
#[derive(Debug, Clone)]
pub struct IncrementalBuilder {
    tree: Octree,
    indexed: BitVec,
}

impl IncrementalBuilder {
    pub fn new(snapshot: &VoxelSnapshot, config: BuildConfig) -> Result<Self, BuildError> {
        Ok(Self {
            tree: Octree::new(snapshot, config)?,
            indexed: bitvec![0; snapshot.count()],
        })
    }

    /// Adds the voxel at `index`, subdividing as needed. Returns `false`
    /// and leaves the tree untouched if the index is outside the snapshot,
    /// already indexed, or its voxel lies outside the root bound.
    pub fn insert(&mut self, index: u32) -> bool {
        if self.indexed.get(index as usize).map_or(true, |bit| *bit) {
            return false;
        }

        let accepted = self.tree.insert(index);
        if accepted {
            self.indexed.set(index as usize, true);
        }
        accepted
    }

    /// The tree built so far.
    pub fn tree(&self) -> &Octree {
        &self.tree
    }

    pub fn finish(self) -> Octree {
        self.tree
    }
}

#[cfg(test)]
fn scattered_voxels(count: usize, seed: u32) -> Vec<crate::Voxel> {
    // Small LCG, enough to spread voxels around without a rand dependency
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        ((state >> 16) % 97) as i16 - 48
    };
    (0..count).map(|i| crate::Voxel::new(next(), next(), next(), [(i % 251) as u8, 0, 255])).collect()
}

#[test]
fn build_matches_sequential_insert_test() {
    let _ = env_logger::builder().is_test(true).try_init();

    let voxels = scattered_voxels(20_000, 7);
    let snapshot = VoxelSnapshot::new(voxels, crate::Cube::from_radius(glam::Vec3::ZERO, 48.0));

    let (built, stats) = OctreeBuilder::new(BuildConfig::new(16)).build(&snapshot).unwrap();

    let mut incremental = IncrementalBuilder::new(&snapshot, BuildConfig::new(16)).unwrap();
    for index in 0..snapshot.count() as u32 {
        assert!(incremental.insert(index));
    }
    let inserted = incremental.finish();

    assert_eq!(built, inserted);
    assert_eq!(stats.accepted, 20_000);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.node_count, built.node_count());

    // Same leaf lists in the same order, not just the same multisets
    for ((_, a), (_, b)) in built.leaves().zip(inserted.leaves()) {
        assert_eq!(a.voxel_indices(), b.voxel_indices());
    }
}

#[test]
fn build_invariants_test() {
    let voxels = scattered_voxels(5_000, 42);
    let snapshot = VoxelSnapshot::new(voxels, crate::Cube::from_radius(glam::Vec3::ZERO, 48.0));
    let tree = build_octree(&snapshot, 8).unwrap();

    assert_eq!(tree.node_count() as u32, 1 + 8 * tree.subdivisions());

    let mut seen = vec![0u32; snapshot.count()];
    for (id, leaf) in tree.leaves() {
        assert!(leaf.voxel_indices().len() <= 8);
        for &index in leaf.voxel_indices() {
            seen[index as usize] += 1;
            let point = snapshot.voxels[index as usize].position();
            assert!(leaf.cube().contains(point));
            assert_eq!(tree.leaf_for(point), Some(id));
        }
    }
    assert!(seen.iter().all(|&count| count == 1));

    for (_, node) in tree.pre_order().filter(|(_, node)| node.is_split()) {
        assert!(node.voxel_indices().is_empty());
    }
}

#[test]
fn build_is_deterministic_test() {
    let voxels = scattered_voxels(10_000, 3);
    let snapshot = VoxelSnapshot::new(voxels, crate::Cube::from_radius(glam::Vec3::ZERO, 48.0));

    let first = build_octree(&snapshot, 4).unwrap();
    for _ in 0..4 {
        let again = build_octree(&snapshot, 4).unwrap();
        assert_eq!(first, again);
    }
}

#[test]
fn build_drops_out_of_bound_voxels_test() {
    use crate::Voxel;

    let voxels = vec![
        Voxel::new(0, 0, 0, [0; 3]),
        Voxel::new(9, 0, 0, [0; 3]),
        Voxel::new(-8, 8, 8, [0; 3]),
        Voxel::new(0, -20, 0, [0; 3]),
    ];
    let snapshot = VoxelSnapshot::new(voxels, crate::Cube::from_radius(glam::Vec3::ZERO, 8.0));
    let (tree, stats) = OctreeBuilder::default().build(&snapshot).unwrap();

    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.dropped, 2);
    assert_eq!(tree.root().voxel_indices(), &[0, 2]);
}

#[test]
fn build_tie_break_test() {
    use crate::Voxel;

    // Nine voxels on the root's center planes
    let voxels: Vec<Voxel> = (0..9).map(|i| Voxel::new(0, if i % 2 == 0 { 0 } else { 3 }, 0, [i as u8; 3])).collect();
    let snapshot = VoxelSnapshot::new(voxels, crate::Cube::from_radius(glam::Vec3::ZERO, 8.0));
    let tree = build_octree(&snapshot, 8).unwrap();

    let root = tree.root();
    let low = tree.node(root.child(0b000).unwrap());
    let up = tree.node(root.child(0b010).unwrap());
    assert_eq!(low.voxel_indices(), &[0, 2, 4, 6, 8]);
    assert_eq!(up.voxel_indices(), &[1, 3, 5, 7]);
}

#[test]
fn build_rejects_bad_input_test() {
    let snapshot = VoxelSnapshot::new(Vec::new(), crate::Cube::from_radius(glam::Vec3::ZERO, 0.0));
    assert_eq!(build_octree(&snapshot, 8).unwrap_err(), BuildError::InvalidBound);

    let snapshot = VoxelSnapshot::new(Vec::new(), crate::Cube::UNIT);
    assert!(matches!(build_octree(&snapshot, 0), Err(BuildError::InvalidConfig(_))));

    let config = BuildConfig::new(8).with_max_depth(20);
    assert!(matches!(OctreeBuilder::new(config).build(&snapshot), Err(BuildError::InvalidConfig(_))));
}

#[test]
fn build_cancelled_test() {
    let token = CancelToken::new();
    token.cancel();

    let snapshot = VoxelSnapshot::new(scattered_voxels(100, 1), crate::Cube::from_radius(glam::Vec3::ZERO, 48.0));
    let result = OctreeBuilder::default()
        .with_cancel_token(token)
        .build(&snapshot);
    assert_eq!(result.unwrap_err(), BuildError::Cancelled);
}

#[test]
fn build_cancelled_during_classification_test() {
    let token = CancelToken::new();
    let builder = OctreeBuilder::new(BuildConfig::new(8)).with_cancel_token(token.clone());
    assert!(builder.build(&VoxelSnapshot::fitted(scattered_voxels(10, 2))).is_ok());

    // Several classification chunks, cancelled once the frame is produced
    let count = 3 * CLASSIFY_CHUNK + 5;
    let mut source = || {
        let snapshot = VoxelSnapshot::fitted(scattered_voxels(count, 9));
        token.cancel();
        snapshot
    };
    let result = builder.build_from_source(&mut source);
    assert_eq!(result.unwrap_err(), BuildError::Cancelled);
}

#[test]
fn incremental_builder_refuses_duplicates_test() {
    let snapshot = VoxelSnapshot::fitted(scattered_voxels(50, 11));
    let mut builder = IncrementalBuilder::new(&snapshot, BuildConfig::new(4)).unwrap();

    for index in 0..50 {
        assert!(builder.insert(index));
    }
    assert!(!builder.insert(0));
    assert!(!builder.insert(49));
    assert!(!builder.insert(50));
    assert_eq!(builder.tree().indexed_voxel_count(), 50);

    let tree = builder.finish();
    assert_eq!(tree, build_octree(&snapshot, 4).unwrap());

    let mut refs = vec![0u32; 50];
    for (_, leaf) in tree.leaves() {
        for &index in leaf.voxel_indices() {
            refs[index as usize] += 1;
        }
    }
    assert!(refs.iter().all(|&count| count == 1));
}

#[test]
fn incremental_builder_out_of_bound_test() {
    use crate::Voxel;

    let voxels = vec![Voxel::new(100, 0, 0, [0; 3]), Voxel::new(1, 0, 0, [0; 3])];
    let snapshot = VoxelSnapshot::new(voxels, crate::Cube::from_radius(glam::Vec3::ZERO, 8.0));
    let mut builder = IncrementalBuilder::new(&snapshot, BuildConfig::default()).unwrap();

    assert!(!builder.insert(0));
    assert!(builder.insert(1));
    assert_eq!(builder.finish().indexed_voxel_count(), 1);
}

#[test]
fn build_from_source_test() {
    let mut frames = 0;
    let mut source = || {
        frames += 1;
        VoxelSnapshot::fitted(scattered_voxels(64, frames))
    };

    let (tree, stats) = OctreeBuilder::new(BuildConfig::new(4)).build_from_source(&mut source).unwrap();
    assert_eq!(stats.dropped, 0);
    assert_eq!(tree.indexed_voxel_count(), 64);
    assert_eq!(frames, 1);
}
