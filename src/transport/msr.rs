//! Serialized 64-bit access to one logical CPU's MSR namespace.
//!
//! Grounded on `gz-rust-perfcnt`'s file-descriptor-wrapping style
//! (`linux::PerfCounter` wraps a raw fd behind a small owned type) and on
//! `original_source/src/msr.h`'s `MsrHandle`/`SafeMsrHandle` split: a raw
//! handle that owns the device fd, and a cheaply-cloned safe handle that is
//! a null object when the core is offline.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{PcmError, Result};

/// One open `/dev/cpu/N/msr` endpoint. Reads/writes are naturally atomic at
/// MSR granularity; callers needing read-modify-write atomicity take the
/// lock held by the owning [`SafeMsrHandle`].
struct RawMsrHandle {
    file: File,
    cpu: i32,
}

impl RawMsrHandle {
    fn open(cpu: i32) -> Result<Self> {
        let primary = format!("/dev/cpu/{cpu}/msr");
        let fallback = format!("/dev/msr{cpu}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&primary)
            .or_else(|_| OpenOptions::new().read(true).write(true).open(&fallback))
            .map_err(|e| PcmError::AccessDenied {
                transport: "msr",
                context: format!("cpu {cpu}: {e}"),
            })?;
        Ok(RawMsrHandle { file, cpu })
    }

    fn read(&self, msr: u32) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, msr as u64)
            .map_err(|e| io_to_pcm(self.cpu, e))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write(&self, msr: u32, value: u64) -> Result<()> {
        self.file
            .write_all_at(&value.to_le_bytes(), msr as u64)
            .map_err(|e| io_to_pcm(self.cpu, e))
    }
}

fn io_to_pcm(cpu: i32, e: io::Error) -> PcmError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        PcmError::MsrAccessDenied { cpu }
    } else {
        PcmError::unknown("msr", format!("cpu {cpu}: {e}"))
    }
}

/// Shared, internally-locked handle onto one logical CPU's MSR space.
///
/// Cloning shares the underlying lock: two clones serialize against each
/// other exactly as two references into the same `Mutex` would. A handle
/// constructed over an offline core is a null object: reads return 0,
/// writes succeed, matching `SafeMsrHandle`'s behavior in the original
/// implementation so callers don't need to special-case offline cores.
#[derive(Clone)]
pub struct SafeMsrHandle {
    inner: Option<Arc<Mutex<RawMsrHandle>>>,
    cpu: i32,
}

impl SafeMsrHandle {
    pub fn open(cpu: i32, online: bool) -> Result<Self> {
        if !online {
            return Ok(SafeMsrHandle { inner: None, cpu });
        }
        let raw = RawMsrHandle::open(cpu)?;
        Ok(SafeMsrHandle { inner: Some(Arc::new(Mutex::new(raw))), cpu })
    }

    pub fn cpu(&self) -> i32 {
        self.cpu
    }

    pub fn is_online(&self) -> bool {
        self.inner.is_some()
    }

    pub fn read(&self, msr: u32) -> Result<u64> {
        match &self.inner {
            Some(lock) => lock.lock().unwrap().read(msr),
            None => Ok(0),
        }
    }

    pub fn write(&self, msr: u32, value: u64) -> Result<()> {
        match &self.inner {
            Some(lock) => lock.lock().unwrap().write(msr, value),
            None => Ok(()),
        }
    }

    /// Hold the endpoint's lock across a read-modify-write sequence supplied
    /// by the caller as a closure, so upper layers get the same atomicity
    /// `lock()`/`unlock()` gave the original implementation without exposing
    /// a bare guard whose lifetime callers could get wrong.
    pub fn with_lock<T>(&self, f: impl FnOnce(&dyn MsrOps) -> Result<T>) -> Result<T> {
        match &self.inner {
            Some(lock) => {
                let guard: MutexGuard<RawMsrHandle> = lock.lock().unwrap();
                f(&*guard)
            }
            None => f(&OfflineMsr),
        }
    }
}

pub trait MsrOps {
    fn read(&self, msr: u32) -> Result<u64>;
    fn write(&self, msr: u32, value: u64) -> Result<()>;
}

impl MsrOps for RawMsrHandle {
    fn read(&self, msr: u32) -> Result<u64> {
        RawMsrHandle::read(self, msr)
    }
    fn write(&self, msr: u32, value: u64) -> Result<()> {
        RawMsrHandle::write(self, msr, value)
    }
}

struct OfflineMsr;
impl MsrOps for OfflineMsr {
    fn read(&self, _msr: u32) -> Result<u64> {
        Ok(0)
    }
    fn write(&self, _msr: u32, _value: u64) -> Result<()> {
        Ok(())
    }
}
