//! Filesystem capacity probe.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Mutex;

use hostcap_quantity::{Quantity, GIB, MIB};

/// Units tried when rounding, largest first.
const LEGIBLE_UNITS: [u64; 2] = [GIB, MIB];

/// Minimum whole-unit count for a unit to be used.
const MIN_LEGIBLE_UNITS: u64 = 10;

/// Measures the total capacity behind a path.
pub trait CapacityProbe: Send + Sync {
    fn total_capacity(&self, path: &Path) -> io::Result<Quantity>;
}

/// Round a byte count down to the largest of GiB or MiB that still leaves at
/// least ten whole units. Smaller values are returned unchanged.
pub fn round_down_legible(bytes: u64) -> u64 {
    for unit in LEGIBLE_UNITS {
        let count = bytes / unit;
        if count >= MIN_LEGIBLE_UNITS {
            return count * unit;
        }
    }
    bytes
}

/// Probe backed by `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsProbe;

impl StatfsProbe {
    /// Raw capacity in bytes (total blocks × fragment size), unrounded.
    pub fn raw_capacity(path: &Path) -> io::Result<u64> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let block_size = if stat.f_frsize > 0 {
            stat.f_frsize as u64
        } else {
            stat.f_bsize as u64
        };
        Ok((stat.f_blocks as u64).saturating_mul(block_size))
    }
}

impl CapacityProbe for StatfsProbe {
    fn total_capacity(&self, path: &Path) -> io::Result<Quantity> {
        Self::raw_capacity(path).map(|bytes| Quantity::from_bytes(round_down_legible(bytes)))
    }
}

/// Probe returning a configured value, for tests and development.
pub struct FixedProbe {
    result: Mutex<Result<Quantity, io::ErrorKind>>,
}

impl FixedProbe {
    pub fn new(total: Quantity) -> Self {
        Self {
            result: Mutex::new(Ok(total)),
        }
    }

    /// A probe that always fails with the given error kind.
    pub fn failing(kind: io::ErrorKind) -> Self {
        Self {
            result: Mutex::new(Err(kind)),
        }
    }

    pub fn set_total(&self, total: Quantity) {
        *self.result.lock().unwrap_or_else(|p| p.into_inner()) = Ok(total);
    }

    pub fn set_failing(&self, kind: io::ErrorKind) {
        *self.result.lock().unwrap_or_else(|p| p.into_inner()) = Err(kind);
    }
}

impl CapacityProbe for FixedProbe {
    fn total_capacity(&self, path: &Path) -> io::Result<Quantity> {
        let result = *self.result.lock().unwrap_or_else(|p| p.into_inner());
        result.map_err(|kind| {
            io::Error::new(kind, format!("probe of {} configured to fail", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case::ten_gib_exact(10 * GIB, 10 * GIB)]
    #[case::nine_gib_falls_to_mib(9 * GIB, 9216 * MIB)]
    #[case::three_mib_stays_raw(3 * MIB, 3 * MIB)]
    #[case::ten_gib_plus_change(10 * GIB + 123_456, 10 * GIB)]
    #[case::mib_remainder_dropped(512 * MIB + 1000, 512 * MIB)]
    #[case::tiny(4096, 4096)]
    #[case::zero(0, 0)]
    fn test_round_down_legible(#[case] bytes: u64, #[case] expected: u64) {
        assert_eq!(round_down_legible(bytes), expected);
    }

    #[test]
    fn test_statfs_probe_on_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let raw = StatfsProbe::raw_capacity(dir.path()).unwrap();
        let total = StatfsProbe.total_capacity(dir.path()).unwrap();

        assert!(raw > 0);
        assert!(total.bytes() <= raw);
        assert_eq!(total.bytes(), round_down_legible(raw));
    }

    #[test]
    fn test_statfs_probe_missing_path() {
        let err = StatfsProbe
            .total_capacity(Path::new("/definitely/not/a/real/path"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_fixed_probe() {
        let probe = FixedProbe::new(Quantity::from_gib(20));
        assert_eq!(probe.total_capacity(Path::new("/x")).unwrap(), Quantity::from_gib(20));

        probe.set_failing(io::ErrorKind::PermissionDenied);
        let err = probe.total_capacity(Path::new("/x")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        probe.set_total(Quantity::from_gib(30));
        assert!(probe.total_capacity(Path::new("/x")).is_ok());
    }

    proptest! {
        #[test]
        fn prop_rounding_never_exceeds_input(bytes in any::<u64>()) {
            let rounded = round_down_legible(bytes);
            prop_assert!(rounded <= bytes);
            if bytes >= 10 * MIB {
                // Anything with ten whole MiB is expressed in whole MiB or GiB.
                prop_assert_eq!(rounded % MIB, 0);
                prop_assert!(bytes - rounded < GIB);
            } else {
                prop_assert_eq!(rounded, bytes);
            }
        }
    }
}
