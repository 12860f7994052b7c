//! Free-space probes used by disk-pressure pruning.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reports how much of the volume holding a store is still free.
pub trait DiskProbe: Send + Sync {
    /// Free fraction in `[0, 1]` for the volume containing `path`.
    ///
    /// `store_bytes` is the current size of all shard segments, for probes
    /// that model capacity rather than asking the OS.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the volume cannot be inspected.
    fn free_ratio(&self, path: &Path, store_bytes: u64) -> io::Result<f64>;
}

/// Asks the operating system via `statvfs(3)`.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

#[cfg(unix)]
impl DiskProbe for StatvfsProbe {
    #[allow(clippy::cast_precision_loss)]
    fn free_ratio(&self, path: &Path, _store_bytes: u64) -> io::Result<f64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat = std::mem::MaybeUninit::<libc::statvfs>::uninit();

        // SAFETY: `c_path` is a valid NUL-terminated string that outlives the
        // call, and `stat` points to writable memory sized for `statvfs`.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: statvfs returned 0, so it fully initialized `stat`.
        let stat = unsafe { stat.assume_init() };

        let total = stat.f_blocks as f64;
        if total <= 0.0 {
            return Ok(1.0);
        }
        Ok((stat.f_bavail as f64 / total).clamp(0.0, 1.0))
    }
}

/// Models a volume of fixed capacity that only the store writes to.
///
/// The free ratio is `1 - store_bytes / capacity`, so evicting shards
/// relieves pressure exactly as it would on a dedicated volume.
#[derive(Debug)]
pub struct FixedDiskProbe {
    capacity_bytes: AtomicU64,
}

impl FixedDiskProbe {
    /// Creates a probe for a volume of `capacity_bytes`.
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes: AtomicU64::new(capacity_bytes),
        }
    }

    /// Changes the modelled capacity.
    pub fn set_capacity(&self, capacity_bytes: u64) {
        self.capacity_bytes.store(capacity_bytes, Ordering::SeqCst);
    }
}

impl DiskProbe for FixedDiskProbe {
    #[allow(clippy::cast_precision_loss)]
    fn free_ratio(&self, _path: &Path, store_bytes: u64) -> io::Result<f64> {
        let capacity = self.capacity_bytes.load(Ordering::SeqCst);
        if capacity == 0 {
            return Ok(0.0);
        }
        let used = store_bytes.min(capacity) as f64;
        Ok(1.0 - used / capacity as f64)
    }
}

impl<P: DiskProbe + ?Sized> DiskProbe for Arc<P> {
    fn free_ratio(&self, path: &Path, store_bytes: u64) -> io::Result<f64> {
        (**self).free_ratio(path, store_bytes)
    }
}

/// The probe for the host platform.
pub fn default_probe() -> Box<dyn DiskProbe> {
    #[cfg(unix)]
    {
        Box::new(StatvfsProbe)
    }
    #[cfg(not(unix))]
    {
        Box::new(FixedDiskProbe::new(u64::MAX))
    }
}
