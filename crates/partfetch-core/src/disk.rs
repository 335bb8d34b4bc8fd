//! Disk budget guard
//!
//! Tracks bytes committed to local artifacts against a configured ceiling.
//! When a probe path is set the real free space of that filesystem is also
//! taken into account. Any doubt about available space is answered with "no".

use crate::error::FetchError;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct FsProbe {
    path: PathBuf,
    min_free: u64,
}

/// Bytes counted against the budget
#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    /// Everything reserved or adopted, written or not
    used: u64,
    /// The part of `used` not yet on disk
    pending: u64,
}

/// Vetoes reservations that would exceed the disk budget
///
/// Written bytes already show up as missing free space on the filesystem,
/// so only `pending` bytes are held against the probe.
#[derive(Debug)]
pub struct DiskBudgetGuard {
    max_bytes: u64,
    usage: Mutex<Usage>,
    probe: Option<FsProbe>,
}

impl DiskBudgetGuard {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            usage: Mutex::new(Usage::default()),
            probe: None,
        }
    }

    /// Also require `min_free` bytes to stay free on the filesystem holding `path`
    pub fn with_fs_probe(mut self, path: impl Into<PathBuf>, min_free: u64) -> Self {
        self.probe = Some(FsProbe {
            path: path.into(),
            min_free,
        });
        self
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn used(&self) -> u64 {
        self.usage.lock().used
    }

    /// Reserved bytes that have not been written yet
    pub fn pending(&self) -> u64 {
        self.usage.lock().pending
    }

    /// Bytes that could be reserved right now
    pub fn available(&self) -> u64 {
        let usage = self.usage.lock();
        self.headroom(&usage)
    }

    /// Reserve `bytes`; returns false and changes nothing if they do not fit
    pub fn reserve(&self, bytes: u64) -> bool {
        let mut usage = self.usage.lock();
        let headroom = self.headroom(&usage);
        if bytes > headroom {
            debug!("Rejected reservation of {} bytes ({} available)", bytes, headroom);
            return false;
        }
        usage.used += bytes;
        usage.pending += bytes;
        true
    }

    /// Like [`reserve`](Self::reserve), but reports the shortfall as an error
    pub fn try_reserve(&self, bytes: u64) -> Result<(), FetchError> {
        if self.reserve(bytes) {
            Ok(())
        } else {
            Err(FetchError::DiskFull {
                required: bytes,
                available: self.available(),
            })
        }
    }

    /// Count bytes already on disk from an earlier run, without any veto
    ///
    /// They are released like any other reservation once consumed.
    pub fn adopt(&self, bytes: u64) {
        self.usage.lock().used += bytes;
    }

    /// Reserved bytes have reached the disk
    pub fn mark_written(&self, bytes: u64) {
        let mut usage = self.usage.lock();
        usage.pending = usage.pending.saturating_sub(bytes);
    }

    /// Written bytes were truncated away but stay reserved for a rewrite
    pub fn mark_unwritten(&self, bytes: u64) {
        let mut usage = self.usage.lock();
        usage.pending = (usage.pending + bytes).min(usage.used);
    }

    /// Return bytes that were reserved but never written
    pub fn forfeit(&self, bytes: u64) {
        let mut usage = self.usage.lock();
        usage.pending = usage.pending.saturating_sub(bytes);
        Self::drop_used(&mut usage, bytes);
    }

    /// Return bytes whose file is gone or no longer ours
    pub fn release(&self, bytes: u64) {
        let mut usage = self.usage.lock();
        Self::drop_used(&mut usage, bytes);
    }

    fn drop_used(usage: &mut Usage, bytes: u64) {
        if bytes > usage.used {
            warn!("Releasing {} bytes but only {} are reserved", bytes, usage.used);
        }
        usage.used = usage.used.saturating_sub(bytes);
        usage.pending = usage.pending.min(usage.used);
    }

    fn headroom(&self, usage: &Usage) -> u64 {
        let budget = self.max_bytes.saturating_sub(usage.used);
        match &self.probe {
            None => budget,
            Some(probe) => match free_space_near(&probe.path) {
                Ok(free) => budget.min(
                    free.saturating_sub(probe.min_free)
                        .saturating_sub(usage.pending),
                ),
                Err(e) => {
                    warn!("Cannot determine free space for {:?}: {}", probe.path, e);
                    0
                }
            },
        }
    }
}

/// Free space of the filesystem holding `path` or its nearest existing ancestor
fn free_space_near(path: &Path) -> std::io::Result<u64> {
    let existing = path
        .ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or_else(|| Path::new("."));
    get_available_space(existing)
}

/// Get available disk space for a path
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string and stat is only read
        // after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            #[allow(clippy::unnecessary_cast)]
            Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;
        use winapi::um::winnt::ULARGE_INTEGER;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and the out pointers are valid.
        unsafe {
            let mut free_to_caller: ULARGE_INTEGER = std::mem::zeroed();
            let mut total: ULARGE_INTEGER = std::mem::zeroed();
            let mut total_free: ULARGE_INTEGER = std::mem::zeroed();
            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_to_caller,
                &mut total,
                &mut total_free,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }
            Ok(*free_to_caller.QuadPart())
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "free space query not supported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_reserve_within_budget() {
        let guard = DiskBudgetGuard::new(100);
        assert!(guard.reserve(60));
        assert_eq!(guard.available(), 40);
        assert!(!guard.reserve(41));
        assert_eq!(guard.used(), 60);
        assert!(guard.reserve(40));
        assert_eq!(guard.available(), 0);
    }

    #[test]
    fn test_release_restores_headroom() {
        let guard = DiskBudgetGuard::new(100);
        assert!(guard.reserve(100));
        guard.release(30);
        assert_eq!(guard.available(), 30);
        guard.release(1_000);
        assert_eq!(guard.used(), 0);
    }

    #[test]
    fn test_adopt_counts_existing_bytes() {
        let guard = DiskBudgetGuard::new(100);
        guard.adopt(70);
        assert_eq!(guard.available(), 30);
        assert!(!guard.reserve(31));
        guard.release(70);
        assert_eq!(guard.used(), 0);
    }

    #[test]
    fn test_try_reserve_reports_shortfall() {
        let guard = DiskBudgetGuard::new(10);
        tokio_test::assert_ok!(guard.try_reserve(4));
        guard.release(4);
        match guard.try_reserve(11) {
            Err(FetchError::DiskFull { required, available }) => {
                assert_eq!(required, 11);
                assert_eq!(available, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_random_sequences_never_exceed_max() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let max = rng.gen_range(1..10_000u64);
            let guard = DiskBudgetGuard::new(max);
            let mut held: Vec<u64> = Vec::new();
            for _ in 0..100 {
                if rng.gen_bool(0.7) {
                    let bytes = rng.gen_range(0..max * 2);
                    if guard.reserve(bytes) {
                        held.push(bytes);
                    }
                } else if let Some(bytes) = held.pop() {
                    guard.release(bytes);
                }
                assert!(guard.used() <= max);
                assert_eq!(guard.used(), held.iter().sum::<u64>());
            }
        }
    }

    #[test]
    fn test_probe_on_missing_path_uses_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let guard = DiskBudgetGuard::new(1024).with_fs_probe(dir.path().join("not/yet/created"), 0);
        // A real filesystem almost always has a KiB free
        assert!(guard.available() <= 1024);
        assert!(guard.reserve(1));
    }

    #[test]
    fn test_probe_with_huge_margin_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let guard = DiskBudgetGuard::new(u64::MAX).with_fs_probe(dir.path(), u64::MAX);
        assert_eq!(guard.available(), 0);
        assert!(!guard.reserve(1));
    }

    #[test]
    fn test_adopted_bytes_not_counted_twice_against_free_space() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("movie.mkv.part001"), vec![0u8; 60_000]).unwrap();
        let free = free_space_near(dir.path()).unwrap();
        if free < 200_000 {
            return;
        }

        // Leave room for 100_000 more bytes beyond what is already written
        let guard = DiskBudgetGuard::new(u64::MAX).with_fs_probe(dir.path(), free - 100_000);
        guard.adopt(60_000);
        assert_eq!(guard.pending(), 0);
        assert!(guard.reserve(60_000));
        assert_eq!(guard.pending(), 60_000);

        // Written reservations stop counting against the filesystem
        guard.mark_written(60_000);
        assert_eq!(guard.pending(), 0);
        assert_eq!(guard.used(), 120_000);
    }

    #[test]
    fn test_forfeit_and_release_keep_pending_within_used() {
        let guard = DiskBudgetGuard::new(1000);
        assert!(guard.reserve(600));
        guard.mark_written(200);
        assert_eq!(guard.pending(), 400);

        guard.forfeit(400);
        assert_eq!(guard.used(), 200);
        assert_eq!(guard.pending(), 0);

        guard.mark_unwritten(500);
        assert_eq!(guard.pending(), 200);
        guard.release(200);
        assert_eq!(guard.used(), 0);
        assert_eq!(guard.pending(), 0);
    }
}
