#![warn(unused_extern_crates)]
//! Adaptive octree index for per-frame voxel reconstructions.
//!
//! A frame's voxels are handed over as a [`VoxelSnapshot`], indexed by an
//! [`OctreeBuilder`] into an [`Octree`] whose leaves hold at most
//! `max_per_cell` voxels, and written to or read from a single binary
//! file with the functions in [`codec`].

pub use glam;

pub(crate) mod utils;

mod error;
pub use error::*;

mod voxel;
pub use voxel::*;

mod bounds;
pub use bounds::*;

pub mod octree;
pub use octree::{ Octree, Node, NodeId, OctreeBuilder, IncrementalBuilder, BuildConfig, BuildStats, CancelToken, build_octree };

pub mod codec;
pub use codec::{ encode, encode_to_vec, decode, decode_slice, read_file, write_file, OctreeReader, OctreeWriter };
