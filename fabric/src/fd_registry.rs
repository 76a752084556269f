//! The process-wide file-descriptor registry.
//!
//! The kernel recycles descriptor integers as soon as they close; a channel
//! mid-teardown can therefore collide with a new channel handed the same
//! number. Each transport thread holds a scoped registration for its
//! descriptor, and a new registration waits until old holders are gone.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::bail;

fn registry() -> &'static Mutex<HashMap<RawFd, usize>> {
    static REGISTRY: OnceLock<Mutex<HashMap<RawFd, usize>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A scoped registration of one descriptor.
pub struct FdGuard {
    fd: RawFd,
}

impl FdGuard {
    /// Registers `fd`, failing when `limit` registrations are already held.
    pub fn try_register(fd: RawFd, limit: usize) -> Option<FdGuard> {
        let mut map = registry().lock().expect("fd registry poisoned");
        let count = map.entry(fd).or_insert(0);
        if *count >= limit {
            return None;
        }
        *count += 1;
        Some(FdGuard { fd })
    }

    /// Registers `fd`, retrying up to ten times at 100 ms intervals while
    /// previous holders finish tearing down.
    pub fn acquire(fd: RawFd, limit: usize) -> anyhow::Result<FdGuard> {
        let mut tries = 0;
        loop {
            if let Some(guard) = FdGuard::try_register(fd, limit) {
                return Ok(guard);
            }
            if tries >= 10 {
                bail!("file descriptor {} still registered after {} attempts", fd, tries);
            }
            thread::sleep(Duration::from_millis(100));
            tries += 1;
        }
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        let mut map = registry().lock().expect("fd registry poisoned");
        if let Some(count) = map.get_mut(&self.fd) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.fd);
            }
        }
    }
}
