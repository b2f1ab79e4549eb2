use std::{
    fmt,
    io,
    path::PathBuf,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    InvalidConfig(&'static str),
    InvalidBound,
    TooManyVoxels {
        count: usize,
    },
    Cancelled,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(reason) => write!(f, "invalid build configuration: {reason}"),
            Self::InvalidBound => write!(f, "root bound must have a finite center and a positive finite halfsize"),
            Self::TooManyVoxels { count } => write!(f, "{count} voxels cannot be indexed with 32 bit references"),
            Self::Cancelled => write!(f, "octree build was cancelled"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Reasons a byte stream is not a well formed octree.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    Truncated,
    BadMagic([u8; 4]),
    UnsupportedVersion {
        expected: u16,
        actual: u16,
    },
    InvalidHeader(&'static str),
    UnknownFlags {
        node: u32,
        flags: u8,
    },
    MisplacedRoot {
        node: u32,
    },
    MissingRoot,
    InvalidGeometry {
        node: u32,
    },
    ChildGeometryMismatch {
        node: u32,
        octant: u8,
    },
    DepthExceeded {
        node: u32,
        max_depth: u8,
    },
    OverfullLeaf {
        node: u32,
        count: u32,
        max_per_cell: u32,
    },
    MisplacedVoxel {
        node: u32,
    },
    NodeCountMismatch {
        declared: u32,
        decoded: u32,
    },
    VoxelCountMismatch {
        declared: u32,
        decoded: u64,
    },
    TrailingBytes,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "octree stream ended unexpectedly"),
            Self::BadMagic(magic) => write!(f, "not an octree stream (magic {magic:02x?})"),
            Self::UnsupportedVersion { expected, actual } => write!(
                f,
                "unsupported octree format version: expected {expected}, got {actual}"
            ),
            Self::InvalidHeader(reason) => write!(f, "invalid octree header: {reason}"),
            Self::UnknownFlags { node, flags } => {
                write!(f, "node {node} has unknown flag bits {flags:#010b}")
            }
            Self::MisplacedRoot { node } => write!(f, "node {node} is flagged as root"),
            Self::MissingRoot => write!(f, "first node is not flagged as root"),
            Self::InvalidGeometry { node } => {
                write!(f, "node {node} has a non-finite or non-positive cube")
            }
            Self::ChildGeometryMismatch { node, octant } => write!(
                f,
                "node {node} does not match octant {octant} of its parent"
            ),
            Self::DepthExceeded { node, max_depth } => {
                write!(f, "node {node} lies deeper than the maximum depth {max_depth}")
            }
            Self::OverfullLeaf { node, count, max_per_cell } => write!(
                f,
                "leaf {node} holds {count} voxels above the capacity {max_per_cell}"
            ),
            Self::MisplacedVoxel { node } => {
                write!(f, "leaf {node} holds a voxel that belongs to another cell")
            }
            Self::NodeCountMismatch { declared, decoded } => write!(
                f,
                "node count mismatch: header declares {declared}, stream holds {decoded}"
            ),
            Self::VoxelCountMismatch { declared, decoded } => write!(
                f,
                "voxel count mismatch: header declares {declared}, stream holds {decoded}"
            ),
            Self::TrailingBytes => write!(f, "trailing bytes after the last node"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Failures while moving an octree to or from storage.
#[derive(Debug)]
pub enum StorageError {
    Create {
        path: PathBuf,
        source: io::Error,
    },
    Open {
        path: PathBuf,
        source: io::Error,
    },
    Io(io::Error),
    Decode(DecodeError),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { path, source } => {
                write!(f, "could not create {} for writing: {source}", path.display())
            }
            Self::Open { path, source } => {
                write!(f, "could not open {} for reading: {source}", path.display())
            }
            Self::Io(err) => write!(f, "octree i/o failed: {err}"),
            Self::Decode(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Create { source, .. } | Self::Open { source, .. } => Some(source),
            Self::Io(err) => Some(err),
            Self::Decode(err) => Some(err),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<DecodeError> for StorageError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}
