//! Pack writer/reader codec. The on-disk byte layout is an implementation
//! detail of this writer, not a contract any other tool depends on: a real
//! but minimal `serde`+`bincode` codec.

use crate::iface::PackWriter;
use crate::model::PackFile;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default directory packs are written to when no explicit path is given.
pub const DEFAULT_PACK_DIR: &str = "/var/lib/coldcache";

pub struct BincodePackWriter {
    dir: PathBuf,
}

impl BincodePackWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_dir() -> Self {
        Self::new(DEFAULT_PACK_DIR)
    }

    /// The deterministic per-device path.
    pub fn path_for(&self, pack: &PackFile) -> PathBuf {
        self.path_for_device(pack.device_id)
    }

    /// Same as [`Self::path_for`], without needing a built `PackFile` yet —
    /// used by the `--force-trace` existing-pack check before a trace runs.
    pub fn path_for_device(&self, device_id: crate::model::DeviceId) -> PathBuf {
        self.dir
            .join(format!("pack-{}-{}.bin", device_id.major, device_id.minor))
    }
}

impl PackWriter for BincodePackWriter {
    fn write(&self, pack: &PackFile, explicit_path: Option<&Path>) -> io::Result<PathBuf> {
        let path = match explicit_path {
            Some(p) => p.to_path_buf(),
            None => self.path_for(pack),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(pack)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&path, bytes)?;
        Ok(path)
    }
}

/// Reads a pack previously written by [`BincodePackWriter`]. Used by the
/// (out-of-scope) dump/pretty-printer and by `--dump`'s CLI glue.
pub fn read_pack(path: &Path) -> io::Result<PackFile> {
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceId;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BincodePackWriter::new(dir.path());
        let pack = PackFile {
            device_id: DeviceId { major: 8, minor: 1 },
            rotational: true,
            paths: vec![crate::model::PackPath {
                inode_id: 42,
                group_hint: 3,
                path: "/usr/bin/bash".into(),
            }],
            blocks: vec![crate::model::PackBlock {
                path_index: 0,
                logical_offset: 0,
                length: 4096,
                physical_offset: 8192,
            }],
            groups: vec![3],
        };
        let path = writer.write(&pack, None).unwrap();
        assert_eq!(path, dir.path().join("pack-8-1.bin"));
        let read_back = read_pack(&path).unwrap();
        assert_eq!(read_back.device_id, pack.device_id);
        assert_eq!(read_back.paths, pack.paths);
        assert_eq!(read_back.blocks, pack.blocks);
    }
}
