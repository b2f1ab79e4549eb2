//! Binary storage format for a built octree.
//!
//! Everything is little endian. The stream is a fixed header followed by
//! every node in pre-order, children in octant order, so the shape of the
//! tree is implied by the order of the nodes and no node references
//! another by address.
//! ```text
//! header : magic "VXOT" | version u16 | max_per_cell u32 | max_depth u8
//!          | node_count u32 | voxel_count u32
//! node   : center 3 x f32 | halfsize 3 x f32 | flags u8
//!          [leaf only: count u32 | count x voxel]
//! voxel  : x i16 | y i16 | z i16 | r u8 | g u8 | b u8
//! ```
//! Flag bit 0 marks a split node, bit 1 the root.

use glam::{ Vec3, vec3 };
use log::debug;
use std::io::{ self, Read, Write };

use crate::{
    octree::{ Node, NodeId, OctantKey, Octree },
    BuildConfig, Cube, DecodeError, StorageError, Voxel,
};

mod file;
pub use file::*;

pub const MAGIC: [u8; 4] = *b"VXOT";
pub const VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 4 + 1 + 4 + 4;
const NODE_SIZE: usize = 6 * 4 + 1;

const FLAG_SPLIT: u8 = 0b01;
const FLAG_ROOT: u8 = 0b10;

/// Exact number of bytes [`encode`] produces for `tree`.
pub fn encoded_len(tree: &Octree) -> usize {
    let leaves = tree.leaves().count();
    HEADER_SIZE
        + tree.node_count() * NODE_SIZE
        + leaves * 4
        + tree.indexed_voxel_count() * Voxel::ENCODED_SIZE
}

fn write_vec3<W: Write>(writer: &mut W, v: Vec3) -> io::Result<()> {
    for component in v.to_array() {
        writer.write_all(&component.to_le_bytes())?;
    }
    Ok(())
}

fn write_voxel<W: Write>(writer: &mut W, voxel: &Voxel) -> io::Result<()> {
    let mut bytes = [0u8; Voxel::ENCODED_SIZE];
    bytes[0..2].copy_from_slice(&voxel.x.to_le_bytes());
    bytes[2..4].copy_from_slice(&voxel.y.to_le_bytes());
    bytes[4..6].copy_from_slice(&voxel.z.to_le_bytes());
    bytes[6..9].copy_from_slice(&voxel.rgb());
    writer.write_all(&bytes)
}

pub fn encode<W: Write>(tree: &Octree, mut writer: W) -> io::Result<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&tree.max_per_cell().to_le_bytes())?;
    writer.write_all(&[tree.max_depth()])?;
    writer.write_all(&(tree.node_count() as u32).to_le_bytes())?;
    writer.write_all(&(tree.indexed_voxel_count() as u32).to_le_bytes())?;

    for (id, node) in tree.pre_order() {
        write_vec3(&mut writer, node.center())?;
        write_vec3(&mut writer, node.halfsize())?;

        let mut flags = 0;
        if node.is_split() {
            flags |= FLAG_SPLIT;
        }
        if node.is_root() {
            flags |= FLAG_ROOT;
        }
        writer.write_all(&[flags])?;

        if !node.is_split() {
            writer.write_all(&(node.voxel_indices().len() as u32).to_le_bytes())?;
            for voxel in tree.node_voxels(id) {
                write_voxel(&mut writer, voxel)?;
            }
        }
    }

    writer.flush()
}

pub fn encode_to_vec(tree: &Octree) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(tree));
    encode(tree, &mut buf).expect("writing to a Vec cannot fail");
    buf
}

struct Header {
    config: BuildConfig,
    node_count: u32,
    voxel_count: u32,
}

struct Decoder<R> {
    reader: R,
    header: Header,
    nodes: Vec<Node>,
    voxels: Vec<Voxel>,
    // Octants from the root down to the node being read
    path: OctantKey,
}

fn read_bytes<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N], StorageError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => StorageError::Decode(DecodeError::Truncated),
        _ => StorageError::Io(err),
    })?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, StorageError> {
    read_bytes(reader).map(u32::from_le_bytes)
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header, StorageError> {
    let magic: [u8; 4] = read_bytes(reader)?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic).into());
    }

    let version = u16::from_le_bytes(read_bytes(reader)?);
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion { expected: VERSION, actual: version }.into());
    }

    let max_per_cell = read_u32(reader)?;
    let [max_depth] = read_bytes::<_, 1>(reader)?;
    let node_count = read_u32(reader)?;
    let voxel_count = read_u32(reader)?;

    let config = BuildConfig { max_per_cell, max_depth };
    if config.validate().is_err() {
        return Err(DecodeError::InvalidHeader("capacity or depth out of range").into());
    }
    if node_count % 8 != 1 {
        return Err(DecodeError::InvalidHeader("node count is not 1 + 8k").into());
    }

    Ok(Header {
        config,
        node_count,
        voxel_count,
    })
}

impl<R: Read> Decoder<R> {
    fn read_vec3(&mut self) -> Result<Vec3, StorageError> {
        let [x, y, z] = [(); 3].map(|_| read_bytes(&mut self.reader).map(f32::from_le_bytes));
        Ok(vec3(x?, y?, z?))
    }

    fn read_voxel(&mut self) -> Result<Voxel, StorageError> {
        let bytes: [u8; Voxel::ENCODED_SIZE] = read_bytes(&mut self.reader)?;
        Ok(Voxel::new(
            i16::from_le_bytes([bytes[0], bytes[1]]),
            i16::from_le_bytes([bytes[2], bytes[3]]),
            i16::from_le_bytes([bytes[4], bytes[5]]),
            [bytes[6], bytes[7], bytes[8]],
        ))
    }

    /// Reads one node and, if it is split, its whole subtree. `slot` is
    /// the parent and the octant this node must fill.
    fn read_node(&mut self, slot: Option<(NodeId, u8)>, depth: u8) -> Result<NodeId, StorageError> {
        let index = self.nodes.len() as u32;
        if index >= self.header.node_count {
            return Err(DecodeError::NodeCountMismatch {
                declared: self.header.node_count,
                decoded: index + 1,
            }.into());
        }

        let cube = Cube::new(self.read_vec3()?, self.read_vec3()?);
        let [flags] = read_bytes::<_, 1>(&mut self.reader)?;

        if flags & !(FLAG_SPLIT | FLAG_ROOT) != 0 {
            return Err(DecodeError::UnknownFlags { node: index, flags }.into());
        }
        match (slot, flags & FLAG_ROOT != 0) {
            (None, false) => return Err(DecodeError::MissingRoot.into()),
            (Some(_), true) => return Err(DecodeError::MisplacedRoot { node: index }.into()),
            _ => (),
        }
        if !cube.is_valid() {
            return Err(DecodeError::InvalidGeometry { node: index }.into());
        }
        if let Some((parent, octant)) = slot {
            if cube != self.nodes[parent.index()].cube.child(octant) {
                return Err(DecodeError::ChildGeometryMismatch { node: index, octant }.into());
            }
        }

        let id = NodeId(index);
        self.nodes.push(Node::new(cube, depth, slot.map(|(parent, _)| parent)));

        if flags & FLAG_SPLIT != 0 {
            if depth >= self.header.config.max_depth {
                return Err(DecodeError::DepthExceeded {
                    node: index,
                    max_depth: self.header.config.max_depth,
                }.into());
            }

            let mut children = [id; 8];
            for octant in 0..8u8 {
                self.path.push(octant);
                children[octant as usize] = self.read_node(Some((id, octant)), depth + 1)?;
                self.path.pop();
            }
            self.nodes[id.index()].children = Some(children);
        } else {
            let count = read_u32(&mut self.reader)?;
            if count > self.header.config.max_per_cell && depth < self.header.config.max_depth {
                return Err(DecodeError::OverfullLeaf {
                    node: index,
                    count,
                    max_per_cell: self.header.config.max_per_cell,
                }.into());
            }

            let total = self.voxels.len() as u64 + count as u64;
            if total > self.header.voxel_count as u64 {
                return Err(DecodeError::VoxelCountMismatch {
                    declared: self.header.voxel_count,
                    decoded: total,
                }.into());
            }

            // Every voxel must be one that insertion would route to this leaf
            let root = self.nodes[NodeId::ROOT.index()].cube;
            let first = self.voxels.len() as u32;
            for _ in 0..count {
                let voxel = self.read_voxel()?;
                let point = voxel.position();
                if !cube.contains(point) || OctantKey::locate(&root, point, depth) != self.path {
                    return Err(DecodeError::MisplacedVoxel { node: index }.into());
                }
                self.voxels.push(voxel);
            }
            self.nodes[id.index()].voxels = (first..first + count).collect();
        }

        Ok(id)
    }
}

/// Reads exactly one tree and requires the stream to end right after it.
pub fn decode<R: Read>(mut reader: R) -> Result<Octree, StorageError> {
    let header = read_header(&mut reader)?;

    // Counts come from the stream, so cap what is reserved up front
    let mut decoder = Decoder {
        nodes: Vec::with_capacity(header.node_count.min(1 << 16) as usize),
        voxels: Vec::with_capacity(header.voxel_count.min(1 << 20) as usize),
        reader,
        header,
        path: OctantKey::default(),
    };
    decoder.read_node(None, 0)?;

    let Decoder { mut reader, header, nodes, voxels, .. } = decoder;
    if nodes.len() as u32 != header.node_count {
        return Err(DecodeError::NodeCountMismatch {
            declared: header.node_count,
            decoded: nodes.len() as u32,
        }.into());
    }
    if voxels.len() as u32 != header.voxel_count {
        return Err(DecodeError::VoxelCountMismatch {
            declared: header.voxel_count,
            decoded: voxels.len() as u64,
        }.into());
    }
    match read_bytes::<_, 1>(&mut reader) {
        Ok(_) => return Err(DecodeError::TrailingBytes.into()),
        Err(StorageError::Decode(DecodeError::Truncated)) => (),
        Err(err) => return Err(err),
    }

    debug!("decoded octree: {} nodes, {} voxels", nodes.len(), voxels.len());
    Ok(Octree::from_parts(nodes, voxels.into(), header.config))
}

pub fn decode_slice(bytes: &[u8]) -> Result<Octree, StorageError> {
    decode(bytes)
}

#[cfg(test)]
fn sample_tree() -> Octree {
    let voxels: Vec<Voxel> = (0..300i16)
        .map(|i| Voxel::new((i * 37) % 61 - 30, (i * 11) % 53 - 26, (i * 5) % 47 - 23, [i as u8, (i * 3) as u8, 7]))
        .collect();
    crate::octree::test_tree(voxels, 32.0, 6)
}

#[cfg(test)]
fn expect_decode_error(bytes: &[u8]) -> DecodeError {
    match decode_slice(bytes) {
        Err(StorageError::Decode(err)) => err,
        other => panic!("expected a decode error, got {other:?}"),
    }
}

#[test]
fn round_trip_test() {
    let tree = sample_tree();
    assert!(tree.subdivisions() > 1);

    let bytes = encode_to_vec(&tree);
    assert_eq!(bytes.len(), encoded_len(&tree));

    let decoded = decode_slice(&bytes).unwrap();
    assert_eq!(decoded, tree);
    assert_eq!(decoded.node_count(), tree.node_count());
    assert_eq!(decoded.subdivisions(), tree.subdivisions());

    // Re-encoding a decoded tree is byte for byte stable
    assert_eq!(encode_to_vec(&decoded), bytes);
}

#[test]
fn round_trip_empty_test() {
    let tree = crate::octree::test_tree(Vec::new(), 4.0, 8);
    let decoded = decode_slice(&encode_to_vec(&tree)).unwrap();

    assert_eq!(decoded.node_count(), 1);
    assert!(decoded.root().is_root());
    assert!(!decoded.root().is_split());
    assert_eq!(decoded, tree);
}

#[test]
fn decoded_tree_walk_test() {
    let tree = sample_tree();
    let decoded = decode_slice(&encode_to_vec(&tree)).unwrap();

    for (id, node) in decoded.pre_order() {
        if let Some(children) = node.children() {
            for (octant, child) in children.iter().enumerate() {
                let child = decoded.node(*child);
                assert_eq!(child.parent(), Some(id));
                assert_eq!(child.depth(), node.depth() + 1);
                assert_eq!(child.cube(), node.cube().child(octant as u8));
            }
        }
        for voxel in decoded.node_voxels(id) {
            assert!(node.cube().contains(voxel.position()));
        }
    }
}

#[test]
fn truncated_stream_test() {
    let bytes = encode_to_vec(&sample_tree());

    assert_eq!(expect_decode_error(&bytes[..bytes.len() - 1]), DecodeError::Truncated);
    assert_eq!(expect_decode_error(&bytes[..HEADER_SIZE + 3]), DecodeError::Truncated);
    assert_eq!(expect_decode_error(&[]), DecodeError::Truncated);
}

#[test]
fn trailing_bytes_test() {
    let mut bytes = encode_to_vec(&sample_tree());
    bytes.push(0);
    assert_eq!(expect_decode_error(&bytes), DecodeError::TrailingBytes);
}

#[test]
fn bad_header_test() {
    let bytes = encode_to_vec(&sample_tree());

    let mut bad = bytes.clone();
    bad[0] = b'X';
    assert!(matches!(expect_decode_error(&bad), DecodeError::BadMagic(_)));

    let mut bad = bytes.clone();
    bad[4..6].copy_from_slice(&7u16.to_le_bytes());
    assert_eq!(expect_decode_error(&bad), DecodeError::UnsupportedVersion { expected: VERSION, actual: 7 });

    let mut bad = bytes.clone();
    bad[6..10].copy_from_slice(&0u32.to_le_bytes());
    assert!(matches!(expect_decode_error(&bad), DecodeError::InvalidHeader(_)));

    let mut bad = bytes.clone();
    bad[11..15].copy_from_slice(&2u32.to_le_bytes());
    assert!(matches!(expect_decode_error(&bad), DecodeError::InvalidHeader(_)));
}

#[test]
fn malformed_node_test() {
    let tree = sample_tree();
    let bytes = encode_to_vec(&tree);
    let flags_at = HEADER_SIZE + 24;

    let mut bad = bytes.clone();
    bad[flags_at] |= 0b100;
    assert_eq!(expect_decode_error(&bad), DecodeError::UnknownFlags { node: 0, flags: bad[flags_at] });

    let mut bad = bytes.clone();
    bad[flags_at] &= !FLAG_ROOT;
    assert_eq!(expect_decode_error(&bad), DecodeError::MissingRoot);

    // Root halfsize x
    let mut bad = bytes.clone();
    bad[HEADER_SIZE + 12..HEADER_SIZE + 16].copy_from_slice(&(-1.0f32).to_le_bytes());
    assert_eq!(expect_decode_error(&bad), DecodeError::InvalidGeometry { node: 0 });

    // First child center x
    let mut bad = bytes.clone();
    let child_at = HEADER_SIZE + NODE_SIZE;
    bad[child_at..child_at + 4].copy_from_slice(&1000.0f32.to_le_bytes());
    assert_eq!(expect_decode_error(&bad), DecodeError::ChildGeometryMismatch { node: 1, octant: 0 });

    // First child claims to be the root
    let mut bad = bytes.clone();
    bad[child_at + 24] |= FLAG_ROOT;
    assert_eq!(expect_decode_error(&bad), DecodeError::MisplacedRoot { node: 1 });
}

#[test]
fn misplaced_voxel_test() {
    // One voxel in each child of the root, two in child 7
    let mut voxels: Vec<Voxel> = crate::OCTANT_SIGNS.iter().map(|sign| {
        let p = *sign * 4.0;
        Voxel::new(p.x as i16, p.y as i16, p.z as i16, [0; 3])
    }).collect();
    voxels.push(Voxel::new(2, 2, 2, [0; 3]));
    let tree = crate::octree::test_tree(voxels, 16.0, 8);
    let bytes = encode_to_vec(&tree);

    // Leaves 0 to 3 each take a node, a count and one voxel
    let leaf_size = NODE_SIZE + 4 + Voxel::ENCODED_SIZE;
    let voxel_x = |octant: usize| HEADER_SIZE + NODE_SIZE + octant * leaf_size + NODE_SIZE + 4;
    assert_eq!(i16::from_le_bytes([bytes[voxel_x(0)], bytes[voxel_x(0) + 1]]), -4);
    assert_eq!(i16::from_le_bytes([bytes[voxel_x(4)], bytes[voxel_x(4) + 1]]), 4);

    // Outside the root bound altogether
    let mut bad = bytes.clone();
    bad[voxel_x(0)..voxel_x(0) + 2].copy_from_slice(&30000i16.to_le_bytes());
    assert_eq!(expect_decode_error(&bad), DecodeError::MisplacedVoxel { node: 1 });

    // On the center plane, which belongs to the lower child
    let mut bad = bytes.clone();
    bad[voxel_x(4)..voxel_x(4) + 2].copy_from_slice(&0i16.to_le_bytes());
    assert_eq!(expect_decode_error(&bad), DecodeError::MisplacedVoxel { node: 5 });

    // Moving a voxel within its own leaf is fine
    let mut moved = bytes.clone();
    moved[voxel_x(0)..voxel_x(0) + 2].copy_from_slice(&(-5i16).to_le_bytes());
    let decoded = decode_slice(&moved).unwrap();
    assert_eq!(decoded.node_voxels(NodeId(1)).next().map(|voxel| voxel.x), Some(-5));
}

#[test]
fn encode_write_failure_test() {
    struct FailAfter(usize);

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.0 == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "device full"));
            }
            let written = buf.len().min(self.0);
            self.0 -= written;
            Ok(written)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let tree = sample_tree();
    let err = encode(&tree, FailAfter(HEADER_SIZE + 3 * NODE_SIZE)).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::Other);
    assert!(encode(&tree, FailAfter(encoded_len(&tree))).is_ok());
}

#[test]
fn count_mismatch_test() {
    let bytes = encode_to_vec(&sample_tree());

    let mut bad = bytes.clone();
    let voxel_count = u32::from_le_bytes([bad[15], bad[16], bad[17], bad[18]]);
    bad[15..19].copy_from_slice(&(voxel_count + 1).to_le_bytes());
    assert!(matches!(
        expect_decode_error(&bad),
        DecodeError::VoxelCountMismatch { declared, decoded } if declared == voxel_count + 1 && decoded == voxel_count as u64
    ));

    let mut bad = bytes.clone();
    let node_count = u32::from_le_bytes([bad[11], bad[12], bad[13], bad[14]]);
    bad[11..15].copy_from_slice(&(node_count - 8).to_le_bytes());
    assert!(matches!(expect_decode_error(&bad), DecodeError::NodeCountMismatch { declared, .. } if declared == node_count - 8));
}

#[test]
fn depth_limit_test() {
    let voxels = vec![Voxel::new(1, 1, 1, [0; 3]); 3];
    let snapshot = crate::VoxelSnapshot::new(voxels, Cube::from_radius(Vec3::ZERO, 4.0));
    let tree = crate::OctreeBuilder::new(BuildConfig::new(1).with_max_depth(2))
        .build(&snapshot)
        .unwrap()
        .0;
    assert_eq!(tree.subdivisions(), 2);

    // Pretend the tree was built with a shallower limit
    let mut bad = encode_to_vec(&tree);
    bad[10] = 1;
    assert!(matches!(expect_decode_error(&bad), DecodeError::DepthExceeded { max_depth: 1, .. }));

    // Deepest leaves may exceed the capacity
    let decoded = decode_slice(&encode_to_vec(&tree)).unwrap();
    assert_eq!(decoded, tree);
}
