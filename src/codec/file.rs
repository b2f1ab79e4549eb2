use log::{ info, warn };
use std::{
    ffi::OsString,
    fs::{ self, File },
    io::{ BufReader, BufWriter },
    path::{ Path, PathBuf },
};

use crate::{
    codec::{ decode, encode },
    utils::timed,
    Octree, StorageError,
};

/// Destination file for one encoded tree.
///
/// The tree is written to a sibling `.partial` file first and only renamed
/// over the destination once it is complete and synced, so a failed write
/// leaves the destination as it was. [`OctreeWriter::write`] consumes the
/// writer, so the file is held for a single tree and closed on every exit
/// path.
pub struct OctreeWriter {
    file: BufWriter<File>,
    partial: PathBuf,
    path: PathBuf,
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".partial");
    name.into()
}

fn commit(mut file: BufWriter<File>, tree: &Octree, partial: &Path, path: &Path) -> Result<(), StorageError> {
    encode(tree, &mut file)?;
    file.get_mut().sync_all()?;
    drop(file);
    fs::rename(partial, path)?;
    Ok(())
}

impl OctreeWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let partial = partial_path(&path);
        let file = File::create(&partial).map_err(|source| StorageError::Create {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            file: BufWriter::new(file),
            partial,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(self, tree: &Octree) -> Result<(), StorageError> {
        let Self { file, partial, path } = self;

        if let Err(err) = timed!(commit(file, tree, &partial, &path), "octree encoding") {
            if let Err(cleanup) = fs::remove_file(&partial) {
                warn!("could not remove {}: {cleanup}", partial.display());
            }
            return Err(err);
        }

        info!("wrote octree with {} nodes to {}", tree.node_count(), path.display());
        Ok(())
    }
}

/// Source file holding one encoded tree.
pub struct OctreeReader {
    file: BufReader<File>,
    path: PathBuf,
}

impl OctreeReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            file: BufReader::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(mut self) -> Result<Octree, StorageError> {
        let tree = timed!(decode(&mut self.file)?, "octree decoding");

        info!("read octree with {} nodes from {}", tree.node_count(), self.path.display());
        Ok(tree)
    }
}

pub fn write_file(path: impl AsRef<Path>, tree: &Octree) -> Result<(), StorageError> {
    OctreeWriter::create(path)?.write(tree)
}

pub fn read_file(path: impl AsRef<Path>) -> Result<Octree, StorageError> {
    OctreeReader::open(path)?.read()
}

#[cfg(test)]
fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("voxtree-{}-{name}.vxot", std::process::id()))
}

#[test]
fn file_round_trip_test() {
    use crate::{ BuildConfig, Cube, OctreeBuilder, Voxel, VoxelSnapshot };

    let _ = env_logger::builder().is_test(true).try_init();

    let voxels: Vec<Voxel> = (0..500i16)
        .map(|i| Voxel::new(i % 23 - 11, i % 19 - 9, i % 17 - 8, [i as u8, 0, 0]))
        .collect();
    let snapshot = VoxelSnapshot::fitted(voxels);
    let (tree, _) = OctreeBuilder::new(BuildConfig::new(10)).build(&snapshot).unwrap();

    let path = temp_path("round-trip");
    let writer = OctreeWriter::create(&path).unwrap();
    assert_eq!(writer.path(), path.as_path());
    writer.write(&tree).unwrap();

    let decoded = read_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(decoded, tree);
    assert_eq!(decoded.bound(), Cube::from_radius(glam::Vec3::ZERO, 11.0));
}

#[test]
fn missing_file_test() {
    let path = temp_path("does-not-exist");
    match read_file(&path) {
        Err(StorageError::Open { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected an open error, got {other:?}"),
    }
}

#[test]
fn uncreatable_file_test() {
    let path = temp_path("missing-dir").join("tree.vxot");
    assert!(matches!(OctreeWriter::create(&path), Err(StorageError::Create { .. })));
}

#[test]
fn failed_write_leaves_no_file_test() {
    let snapshot = crate::VoxelSnapshot::fitted(vec![crate::Voxel::new(1, 2, 3, [4, 5, 6]); 20]);
    let tree = crate::build_octree(&snapshot, 8).unwrap();

    // A directory in the way makes the final rename fail after encoding
    let path = temp_path("blocked");
    fs::create_dir_all(&path).unwrap();
    let result = write_file(&path, &tree);
    let partial_left = partial_path(&path).exists();
    let still_dir = path.is_dir();
    fs::remove_dir(&path).unwrap();

    assert!(matches!(result, Err(StorageError::Io(_))));
    assert!(!partial_left);
    assert!(still_dir);
}

#[test]
fn write_replaces_existing_file_test() {
    let snapshot = crate::VoxelSnapshot::fitted(vec![crate::Voxel::new(-3, 0, 7, [1; 3]); 12]);
    let tree = crate::build_octree(&snapshot, 4).unwrap();

    let path = temp_path("replace");
    fs::write(&path, b"stale").unwrap();
    write_file(&path, &tree).unwrap();
    let decoded = read_file(&path);
    let partial_left = partial_path(&path).exists();
    fs::remove_file(&path).unwrap();

    assert_eq!(decoded.unwrap(), tree);
    assert!(!partial_left);
}

#[test]
fn truncated_file_test() {
    use crate::{ DecodeError, Voxel, VoxelSnapshot };

    let snapshot = VoxelSnapshot::fitted(vec![Voxel::new(1, 2, 3, [4, 5, 6]); 3]);
    let tree = crate::build_octree(&snapshot, 8).unwrap();
    let mut bytes = crate::encode_to_vec(&tree);
    bytes.pop();

    let path = temp_path("truncated");
    std::fs::write(&path, &bytes).unwrap();
    let result = read_file(&path);
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(result, Err(StorageError::Decode(DecodeError::Truncated))));
}
