use std::sync::Arc;
use glam::{ Vec3, vec3 };

use crate::Cube;

/// A coloured sample of reconstructed space.
///
/// Coordinates are quantized to the reconstruction grid, so they are
/// kept as integers and only converted to float space when the octree
/// needs to classify them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Voxel {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Voxel {
    /// Size of one voxel in the binary tree format.
    pub const ENCODED_SIZE: usize = 9;

    pub const fn new(x: i16, y: i16, z: i16, rgb: [u8; 3]) -> Self {
        Self {
            x, y, z,
            r: rgb[0],
            g: rgb[1],
            b: rgb[2],
        }
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        vec3(self.x as f32, self.y as f32, self.z as f32)
    }

    #[inline]
    pub fn rgb(&self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

/// One frame worth of voxels together with the cube they are indexed in.
///
/// The voxel array is shared, not copied: the built tree keeps a handle
/// to it and its leaves refer to voxels by index.
#[derive(Debug, Clone)]
pub struct VoxelSnapshot {
    pub voxels: Arc<[Voxel]>,
    pub bound: Cube,
}

impl VoxelSnapshot {
    pub fn new(voxels: impl Into<Arc<[Voxel]>>, bound: Cube) -> Self {
        Self {
            voxels: voxels.into(),
            bound,
        }
    }

    /// Wraps the voxels in the smallest origin-centred cube that holds all of them.
    pub fn fitted(voxels: impl Into<Arc<[Voxel]>>) -> Self {
        let voxels = voxels.into();
        let bound = Cube::enclosing(&voxels);
        Self { voxels, bound }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.voxels.len()
    }
}

/// Producer of per-frame voxel snapshots, e.g. a silhouette carving stage.
pub trait VoxelSource {
    fn voxel_snapshot(&mut self) -> VoxelSnapshot;
}

impl<F: FnMut() -> VoxelSnapshot> VoxelSource for F {
    fn voxel_snapshot(&mut self) -> VoxelSnapshot {
        self()
    }
}

#[test]
fn voxel_position_test() {
    let voxel = Voxel::new(-3, 0, 12, [255, 128, 0]);
    assert_eq!(voxel.position(), vec3(-3.0, 0.0, 12.0));
    assert_eq!(voxel.rgb(), [255, 128, 0]);
}

#[test]
fn fitted_snapshot_test() {
    let snapshot = VoxelSnapshot::fitted(vec![
        Voxel::new(1, -40, 2, [0; 3]),
        Voxel::new(7, 3, 25, [0; 3]),
    ]);

    assert_eq!(snapshot.count(), 2);
    assert_eq!(snapshot.bound.center, Vec3::ZERO);
    assert_eq!(snapshot.bound.halfsize, Vec3::splat(40.0));
    assert!(snapshot.voxels.iter().all(|v| snapshot.bound.contains(v.position())));
}
