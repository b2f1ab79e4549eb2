use ahash::AHashMap;
use arrayvec::ArrayVec;
use glam::Vec3;
use std::sync::Arc;

use crate::{ Cube, Voxel, VoxelSnapshot, BuildError };

mod octant_key;
pub use octant_key::*;

mod build;
pub use build::*;

/// Stable index of a node in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub const ROOT: Self = Self(0);

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) cube: Cube,
    pub(crate) depth: u8,
    // Bookkeeping only, the arena owns every node.
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Option<[NodeId; 8]>,
    pub(crate) voxels: Vec<u32>,
}

impl Node {
    pub(crate) fn new(cube: Cube, depth: u8, parent: Option<NodeId>) -> Self {
        Self {
            cube,
            depth,
            parent,
            children: None,
            voxels: Vec::new(),
        }
    }

    #[inline]
    pub fn cube(&self) -> Cube {
        self.cube
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        self.cube.center
    }

    #[inline]
    pub fn halfsize(&self) -> Vec3 {
        self.cube.halfsize
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_split(&self) -> bool {
        self.children.is_some()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child slots in octant order, `None` for a leaf.
    pub fn children(&self) -> Option<&[NodeId; 8]> {
        self.children.as_ref()
    }

    pub fn child(&self, octant: u8) -> Option<NodeId> {
        self.children.map(|children| children[octant as usize & 7])
    }

    /// Indices into the tree's voxel array. Always empty once split.
    pub fn voxel_indices(&self) -> &[u32] {
        &self.voxels
    }
}

/// Adaptive octree over a shared voxel array.
///
/// Nodes live in a flat arena and refer to each other by [`NodeId`];
/// the root is always [`NodeId::ROOT`]. Leaves hold indices into the
/// voxel array rather than copies of the voxels.
#[derive(Debug, Clone)]
pub struct Octree {
    nodes: Vec<Node>,
    voxels: Arc<[Voxel]>,
    config: BuildConfig,
    subdivisions: u32,
}

impl Octree {
    /// An unsplit root over the snapshot's bound. Voxels are added with
    /// [`Octree::insert`]; outside the crate trees come from
    /// [`OctreeBuilder`], [`IncrementalBuilder`] or the decoder.
    pub(crate) fn new(snapshot: &VoxelSnapshot, config: BuildConfig) -> Result<Self, BuildError> {
        config.validate()?;
        if !snapshot.bound.is_valid() {
            return Err(BuildError::InvalidBound);
        }
        if u32::try_from(snapshot.count()).is_err() {
            return Err(BuildError::TooManyVoxels { count: snapshot.count() });
        }

        Ok(Self::empty(snapshot.voxels.clone(), snapshot.bound, config))
    }

    pub(crate) fn empty(voxels: Arc<[Voxel]>, bound: Cube, config: BuildConfig) -> Self {
        Self {
            nodes: vec![Node::new(bound, 0, None)],
            voxels,
            config,
            subdivisions: 0,
        }
    }

    /// Rebuilds a tree from nodes laid out by a decoder. The caller
    /// guarantees the arena is internally consistent.
    pub(crate) fn from_parts(nodes: Vec<Node>, voxels: Arc<[Voxel]>, config: BuildConfig) -> Self {
        let subdivisions = nodes.iter().filter(|node| node.is_split()).count() as u32;
        Self {
            nodes,
            voxels,
            config,
            subdivisions,
        }
    }

    pub fn root(&self) -> &Node {
        &self.nodes[NodeId::ROOT.index()]
    }

    pub fn bound(&self) -> Cube {
        self.root().cube
    }

    /// # Panics
    /// If `id` does not belong to this tree.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn subdivisions(&self) -> u32 {
        self.subdivisions
    }

    pub fn config(&self) -> BuildConfig {
        self.config
    }

    pub fn max_per_cell(&self) -> u32 {
        self.config.max_per_cell
    }

    pub fn max_depth(&self) -> u8 {
        self.config.max_depth
    }

    /// The backing voxel array, including any voxels that were dropped
    /// for lying outside the root bound.
    pub fn voxels(&self) -> &Arc<[Voxel]> {
        &self.voxels
    }

    pub fn node_voxels(&self, id: NodeId) -> impl Iterator<Item = &Voxel> + '_ {
        self.node(id).voxels.iter().map(|&index| &self.voxels[index as usize])
    }

    /// Number of voxels referenced by leaves.
    pub fn indexed_voxel_count(&self) -> usize {
        self.nodes.iter().map(|node| node.voxels.len()).sum()
    }

    /// Rough heap footprint of the node arena and the leaf lists.
    pub fn memory_usage(&self) -> usize {
        self.nodes.len() * std::mem::size_of::<Node>()
            + self.indexed_voxel_count() * std::mem::size_of::<u32>()
    }

    /// Leaf whose cube holds `point`, following the same tie-break as insertion.
    pub fn leaf_for(&self, point: Vec3) -> Option<NodeId> {
        if !self.bound().contains(point) {
            return None;
        }

        let mut id = NodeId::ROOT;
        while let Some(children) = self.node(id).children {
            id = children[self.node(id).cube.octant(point) as usize];
        }
        Some(id)
    }

    /// Adds the voxel at `index` of the backing array, subdividing any
    /// leaf that grows past `max_per_cell`. Returns `false` if the voxel
    /// lies outside the root bound.
    ///
    /// Does not check whether `index` is already referenced by a leaf.
    ///
    /// # Panics
    /// If `index` is outside the voxel array.
    pub(crate) fn insert(&mut self, index: u32) -> bool {
        let point = self.voxels[index as usize].position();
        let Some(leaf) = self.leaf_for(point) else {
            return false;
        };

        self.nodes[leaf.index()].voxels.push(index);
        self.rebalance(leaf);
        true
    }

    fn overflows(&self, id: NodeId) -> bool {
        let node = self.node(id);
        node.voxels.len() > self.config.max_per_cell as usize && node.depth < self.config.max_depth
    }

    fn rebalance(&mut self, id: NodeId) {
        if !self.overflows(id) {
            return;
        }

        let children = self.subdivide(id);
        let cube = self.node(id).cube;
        let voxels = std::mem::take(&mut self.nodes[id.index()].voxels);
        for index in voxels {
            let octant = cube.octant(self.voxels[index as usize].position());
            self.nodes[children[octant as usize].index()].voxels.push(index);
        }

        // Everything may have landed in one child
        for child in children {
            self.rebalance(child);
        }
    }

    /// Allocates the eight children of a leaf in octant order. Does not
    /// move any voxels.
    pub(crate) fn subdivide(&mut self, id: NodeId) -> [NodeId; 8] {
        let parent = self.node(id);
        debug_assert!(!parent.is_split());

        let depth = parent.depth + 1;
        let first = self.nodes.len() as u32;
        let children = [0, 1, 2, 3, 4, 5, 6, 7].map(|octant| NodeId(first + octant));
        let cubes = parent.cube.subdivide();

        self.nodes.extend(cubes.into_iter().map(|cube| Node::new(cube, depth, Some(id))));
        self.nodes[id.index()].children = Some(children);
        self.subdivisions += 1;
        children
    }

    pub(crate) fn set_leaf_voxels(&mut self, id: NodeId, voxels: Vec<u32>) {
        self.nodes[id.index()].voxels = voxels;
    }

    /// Depth first walk, children in octant order. This is the order
    /// nodes are written to storage in.
    pub fn pre_order(&self) -> PreOrder<'_> {
        let mut stack = ArrayVec::new();
        stack.push(NodeId::ROOT);
        PreOrder {
            tree: self,
            stack,
        }
    }

    pub fn leaves(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.pre_order().filter(|(_, node)| !node.is_split())
    }

    /// Same shape, same cubes and flags at every position, and the same
    /// voxels in every leaf regardless of their order within the leaf.
    pub fn same_structure(&self, other: &Octree) -> bool {
        if self.node_count() != other.node_count() {
            return false;
        }

        self.pre_order().zip(other.pre_order()).all(|((a_id, a), (b_id, b))| {
            a.cube == b.cube
                && a.depth == b.depth
                && a.is_root() == b.is_root()
                && a.is_split() == b.is_split()
                && a.voxels.len() == b.voxels.len()
                && *voxel_counts(self.node_voxels(a_id)) == *voxel_counts(other.node_voxels(b_id))
        })
    }
}

impl PartialEq for Octree {
    fn eq(&self, other: &Self) -> bool {
        self.config == other.config && self.same_structure(other)
    }
}

fn voxel_counts<'a>(voxels: impl Iterator<Item = &'a Voxel>) -> AHashMap<Voxel, usize> {
    let mut counts = AHashMap::new();
    for voxel in voxels {
        *counts.entry(*voxel).or_insert(0) += 1;
    }
    counts
}

// Pending siblings never exceed 7 per level below the root.
const WALK_STACK_SIZE: usize = 1 + 7 * OctantKey::MAX_DEPTH as usize;

pub struct PreOrder<'a> {
    tree: &'a Octree,
    stack: ArrayVec<NodeId, WALK_STACK_SIZE>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = (NodeId, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = self.tree.node(id);
        if let Some(children) = node.children.as_ref() {
            self.stack.extend(children.iter().rev().copied());
        }
        Some((id, node))
    }
}

#[cfg(test)]
pub(crate) fn test_tree(voxels: Vec<Voxel>, radius: f32, max_per_cell: u32) -> Octree {
    let snapshot = VoxelSnapshot::new(voxels, Cube::from_radius(Vec3::ZERO, radius));
    let mut tree = Octree::new(&snapshot, BuildConfig::new(max_per_cell)).unwrap();
    for index in 0..snapshot.count() as u32 {
        tree.insert(index);
    }
    tree
}

#[test]
fn empty_tree_test() {
    let tree = test_tree(Vec::new(), 16.0, 8);

    assert_eq!(tree.node_count(), 1);
    assert!(tree.root().is_root());
    assert!(!tree.root().is_split());
    assert!(tree.root().voxel_indices().is_empty());
    assert_eq!(tree.subdivisions(), 0);
}

#[test]
fn single_split_test() {
    // One voxel per octant around the origin plus an extra one in octant 7
    let mut voxels: Vec<Voxel> = crate::OCTANT_SIGNS.iter().enumerate().map(|(octant, sign)| {
        let p = *sign * 4.0;
        Voxel::new(p.x as i16, p.y as i16, p.z as i16, [octant as u8; 3])
    }).collect();
    voxels.push(Voxel::new(2, 2, 2, [9; 3]));
    let tree = test_tree(voxels.clone(), 16.0, 8);

    assert_eq!(tree.subdivisions(), 1);
    assert_eq!(tree.node_count(), 9);
    assert!(tree.root().is_split());
    assert!(tree.root().voxel_indices().is_empty());

    let root = tree.root();
    for (index, voxel) in voxels.iter().enumerate() {
        let p = voxel.position();
        let octant = ((p.x > 0.0) as u8) << 2 | ((p.y > 0.0) as u8) << 1 | (p.z > 0.0) as u8;
        let child = tree.node(root.child(octant).unwrap());
        assert!(child.voxel_indices().contains(&(index as u32)));
        assert_eq!(child.parent(), Some(NodeId::ROOT));
        assert!(!child.is_split());
    }
    assert_eq!(tree.node(root.child(7).unwrap()).voxel_indices(), &[7, 8]);
}

#[test]
fn capacity_not_exceeded_test() {
    let voxels: Vec<Voxel> = (0..8).map(|i| Voxel::new(i, -i, i, [0; 3])).collect();
    let tree = test_tree(voxels, 16.0, 8);

    assert_eq!(tree.node_count(), 1);
    assert_eq!(tree.root().voxel_indices().len(), 8);
}

#[test]
fn cascading_split_test() {
    // Nine voxels crowded into one corner have to push down several levels
    let voxels: Vec<Voxel> = (0..9).map(|i| Voxel::new(14 + i % 2, 14 + i / 3 % 2, 15, [0; 3])).collect();
    let tree = test_tree(voxels, 16.0, 8);

    assert_eq!(tree.node_count() as u32, 1 + 8 * tree.subdivisions());
    assert!(tree.subdivisions() > 1);
    for (_, leaf) in tree.leaves() {
        assert!(leaf.voxel_indices().len() <= 8);
    }
    assert_eq!(tree.indexed_voxel_count(), 9);
}

#[test]
fn duplicate_voxels_stop_at_max_depth_test() {
    let voxels = vec![Voxel::new(3, 3, 3, [1, 2, 3]); 5];
    let snapshot = VoxelSnapshot::new(voxels, Cube::from_radius(Vec3::ZERO, 8.0));
    let mut tree = Octree::new(&snapshot, BuildConfig::new(2).with_max_depth(4)).unwrap();
    (0..5).for_each(|index| { tree.insert(index); });

    assert_eq!(tree.subdivisions(), 4);
    let leaf = tree.leaf_for(Voxel::new(3, 3, 3, [0; 3]).position()).unwrap();
    assert_eq!(tree.node(leaf).depth(), 4);
    assert_eq!(tree.node(leaf).voxel_indices().len(), 5);
}

#[test]
fn out_of_bound_insert_test() {
    let voxels = vec![Voxel::new(100, 0, 0, [0; 3]), Voxel::new(1, 0, 0, [0; 3])];
    let snapshot = VoxelSnapshot::new(voxels, Cube::from_radius(Vec3::ZERO, 8.0));
    let mut tree = Octree::new(&snapshot, BuildConfig::default()).unwrap();

    assert!(!tree.insert(0));
    assert!(tree.insert(1));
    assert_eq!(tree.indexed_voxel_count(), 1);
}

#[test]
fn pre_order_test() {
    let voxels: Vec<Voxel> = (0..40).map(|i| Voxel::new(i - 20, (i * 7) % 31 - 15, (i * 13) % 29 - 14, [0; 3])).collect();
    let tree = test_tree(voxels, 32.0, 4);

    let order: Vec<NodeId> = tree.pre_order().map(|(id, _)| id).collect();
    assert_eq!(order.len(), tree.node_count());
    assert_eq!(order[0], NodeId::ROOT);

    // Each split node is directly followed by its first child
    for (position, id) in order.iter().enumerate() {
        if let Some(children) = tree.node(*id).children() {
            assert_eq!(order[position + 1], children[0]);
        }
    }
}
