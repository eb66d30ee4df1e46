//! C7 — Pack assembler: per-device aggregation, handed off to the writer
//! writer.

use crate::iface::PackWriter;
use crate::model::{DeviceId, PackFile};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// A pack that was written, and where.
#[derive(Debug, Clone)]
pub struct WrittenPack {
    pub device_id: DeviceId,
    pub path: PathBuf,
}

/// Writes every device's pack, unless `explicit` names both a path and the
/// device it belongs to, in which case only that device's pack is written
/// there: if a pack already exists and the caller supplied a
/// specific output filename, write only the matching device's pack").
pub fn assemble(
    packs: &HashMap<DeviceId, PackFile>,
    writer: &dyn PackWriter,
    explicit: Option<(&Path, DeviceId)>,
) -> io::Result<Vec<WrittenPack>> {
    match explicit {
        Some((path, device_id)) => {
            let pack = packs.get(&device_id).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no traced data for device {device_id:?}"),
                )
            })?;
            let written = writer.write(pack, Some(path))?;
            Ok(vec![WrittenPack {
                device_id,
                path: written,
            }])
        }
        None => {
            let mut out = Vec::with_capacity(packs.len());
            for (device_id, pack) in packs {
                let written = writer.write(pack, None)?;
                out.push(WrittenPack {
                    device_id: *device_id,
                    path: written,
                });
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingWriter {
        calls: RefCell<Vec<(DeviceId, Option<PathBuf>)>>,
    }
    impl PackWriter for RecordingWriter {
        fn write(&self, pack: &PackFile, explicit_path: Option<&Path>) -> io::Result<PathBuf> {
            self.calls
                .borrow_mut()
                .push((pack.device_id, explicit_path.map(Path::to_path_buf)));
            Ok(explicit_path
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(format!("/var/lib/coldcache/{:?}", pack.device_id))))
        }
    }

    fn pack(device_id: DeviceId) -> PackFile {
        PackFile {
            device_id,
            ..Default::default()
        }
    }

    #[test]
    fn writes_all_devices_when_no_explicit_path() {
        let d1 = DeviceId { major: 8, minor: 0 };
        let d2 = DeviceId { major: 8, minor: 1 };
        let packs = HashMap::from([(d1, pack(d1)), (d2, pack(d2))]);
        let writer = RecordingWriter {
            calls: RefCell::new(Vec::new()),
        };
        let written = assemble(&packs, &writer, None).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(writer.calls.borrow().len(), 2);
    }

    #[test]
    fn writes_only_matching_device_when_explicit() {
        let d1 = DeviceId { major: 8, minor: 0 };
        let d2 = DeviceId { major: 8, minor: 1 };
        let packs = HashMap::from([(d1, pack(d1)), (d2, pack(d2))]);
        let writer = RecordingWriter {
            calls: RefCell::new(Vec::new()),
        };
        let path = Path::new("/var/lib/coldcache/pack.out");
        let written = assemble(&packs, &writer, Some((path, d1))).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].device_id, d1);
        assert_eq!(writer.calls.borrow().len(), 1);
    }
}
