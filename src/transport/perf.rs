//! Linux `perf_event_open` pseudo-PMU transport.
//!
//! Grounded on `gz-rust-perfcnt/src/linux/mod.rs`'s `perf_event_open` wrapper
//! and `PerfCounter`: the raw `perf_event_open` syscall has no libc wrapper,
//! so it is invoked through `libc::syscall`, and the returned fd is wrapped
//! in an owned `File` so `Drop` closes it.

use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::os::unix::io::FromRawFd;

use crate::error::{PcmError, Result};

#[repr(C)]
#[derive(Clone, Copy)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period_or_freq: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events_or_watermark: u32,
    bp_type: u32,
    config1_or_bp_addr: u64,
    config2_or_bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
}

pub const PERF_TYPE_RAW: u32 = 4;
const PERF_FORMAT_GROUP: u64 = 1 << 3;
const PERF_EVENT_IOC_RESET: u64 = 0x2403;
const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;

fn perf_event_open(attr: &PerfEventAttr, pid: i32, cpu: i32, group_fd: i32, flags: u64) -> isize {
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr as usize,
            pid,
            cpu,
            group_fd,
            flags,
        ) as isize
    }
}

fn ioctl(fd: libc::c_int, request: u64, value: libc::c_int) -> isize {
    unsafe { libc::ioctl(fd, request, value) as isize }
}

/// A perf pseudo-PMU event: `type` is the numeric id read from
/// `/sys/bus/event_source/devices/<name>/type` for an uncore PMU, or
/// `PERF_TYPE_RAW` for a core event.
pub struct PerfRegister {
    file: File,
    raw_fd: i32,
    attr: PerfEventAttr,
    pid: i32,
    cpu: i32,
}

impl PerfRegister {
    pub fn open_raw(pmu_type: u32, config: u64, cpu: i32, pid: i32) -> Result<Self> {
        Self::open(pmu_type, config, cpu, pid, -1)
    }

    fn open(pmu_type: u32, config: u64, cpu: i32, pid: i32, group_fd: i32) -> Result<Self> {
        let attr = PerfEventAttr {
            type_: pmu_type,
            size: mem::size_of::<PerfEventAttr>() as u32,
            config,
            read_format: if group_fd >= 0 { PERF_FORMAT_GROUP } else { 0 },
            ..zeroed_attr()
        };
        let fd = perf_event_open(&attr, pid, cpu, group_fd, 0) as libc::c_int;
        if fd < 0 {
            return Err(PcmError::AccessDenied {
                transport: "perf",
                context: format!("perf_event_open(type={pmu_type}, config={config:#x}) failed"),
            });
        }
        ioctl(fd, PERF_EVENT_IOC_RESET, 0);
        ioctl(fd, PERF_EVENT_IOC_ENABLE, 0);
        Ok(PerfRegister { file: unsafe { File::from_raw_fd(fd) }, raw_fd: fd, attr, pid, cpu })
    }

    /// Reads the 64-bit counter value.
    pub fn read(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf).map_err(io_err)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Rearms the event with a new raw config by closing and reopening the
    /// fd — `perf_event_open` has no "rewrite config" ioctl, so "write" to a
    /// perf-backed register means reprogram.
    pub fn write(&mut self, config: u64) -> Result<()> {
        let replacement = Self::open(self.attr.type_, config, self.cpu, self.pid, -1)?;
        *self = replacement;
        Ok(())
    }

    pub fn fd(&self) -> i32 {
        self.raw_fd
    }
}

/// Resolve a pseudo-PMU `type` id from `/sys/bus/event_source/devices/<name>/type`,
/// e.g. `uncore_cha_0` for a per-tile CHA box.
pub fn pseudo_pmu_type(name: &str) -> Result<u32> {
    let path = format!("/sys/bus/event_source/devices/{name}/type");
    let raw = std::fs::read_to_string(&path).map_err(|e| PcmError::AccessDenied {
        transport: "perf",
        context: format!("{path}: {e}"),
    })?;
    raw.trim().parse().map_err(|_| PcmError::unknown("perf", format!("malformed type in {path}")))
}

fn zeroed_attr() -> PerfEventAttr {
    unsafe { mem::zeroed() }
}

fn io_err(e: io::Error) -> PcmError {
    PcmError::unknown("perf", e.to_string())
}

/// A perf event group: the leader plus N followers opened with
/// `PERF_FLAG_FD_OUTPUT`-free grouping so a single `read()` on the leader
/// returns every member's value in one kernel call, giving a coherent
/// multi-counter snapshot.
pub struct PerfGroup {
    leader: PerfRegister,
    members: Vec<PerfRegister>,
}

impl PerfGroup {
    pub fn new(leader: PerfRegister) -> Self {
        PerfGroup { leader, members: Vec::new() }
    }

    pub fn add(&mut self, pmu_type: u32, config: u64, cpu: i32, pid: i32) -> Result<()> {
        let member = PerfRegister::open(pmu_type, config, cpu, pid, self.leader.raw_fd)?;
        self.members.push(member);
        Ok(())
    }

    /// One read of the group leader returns `count, value0, value1, ...`
    /// (the `PERF_FORMAT_GROUP` layout); this wraps that into a plain vector
    /// indexed the same way events were added.
    pub fn read_all(&mut self) -> Result<Vec<u64>> {
        let n = self.members.len() + 1;
        let mut buf = vec![0u8; 8 * (n + 1)];
        self.leader.file.read_exact(&mut buf).map_err(io_err)?;
        let mut values = Vec::with_capacity(n);
        for i in 0..n {
            let bytes = &buf[8 * (i + 1)..8 * (i + 2)];
            values.push(u64::from_le_bytes(bytes.try_into().unwrap()));
        }
        Ok(values)
    }
}
