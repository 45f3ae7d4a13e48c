//! Uniform "hardware register" abstraction over the four transports, and
//! width-extension for hardware counters narrower than 64 bits.

pub mod mmio;
pub mod msr;
pub mod pci;
pub mod perf;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use mmio::MmioPage;
use msr::SafeMsrHandle;
use pci::PciHandle;
use perf::PerfRegister;

/// One 64-bit-addressable register, regardless of the backend that holds it.
///
/// Modeled as a tagged variant rather than a trait object (spec.md's
/// "polymorphic hardware register" design note): the inventory holds
/// thousands of these and the hot sampling path benefits from static
/// dispatch through a `match`, not a vtable call.
pub enum HWRegister {
    Msr { handle: SafeMsrHandle, index: u32 },
    Pci32 { handle: Arc<PciHandle>, offset: u32 },
    Pci64 { handle: Arc<PciHandle>, offset: u32 },
    Mmio32 { page: Arc<MmioPage>, offset: usize },
    Mmio64 { page: Arc<MmioPage>, offset: usize },
    /// Software-only latched value, used for synthetic accelerator counters
    /// (e.g. QAT telemetry values parsed from sysfs text).
    Virtual(Arc<AtomicU64>),
    Perf(Arc<Mutex<PerfRegister>>),
}

impl HWRegister {
    pub fn read(&self) -> Result<u64> {
        match self {
            HWRegister::Msr { handle, index } => handle.read(*index),
            HWRegister::Pci32 { handle, offset } => handle.read32(*offset).map(u64::from),
            HWRegister::Pci64 { handle, offset } => handle.read64(*offset),
            HWRegister::Mmio32 { page, offset } => Ok(page.read32(*offset) as u64),
            HWRegister::Mmio64 { page, offset } => Ok(page.read64(*offset)),
            HWRegister::Virtual(v) => Ok(v.load(Ordering::Acquire)),
            HWRegister::Perf(p) => p.lock().unwrap().read(),
        }
    }

    pub fn write(&self, value: u64) -> Result<()> {
        match self {
            HWRegister::Msr { handle, index } => handle.write(*index, value),
            HWRegister::Pci32 { handle, offset } => handle.write32(*offset, value as u32),
            HWRegister::Pci64 { handle, offset } => handle.write64(*offset, value),
            HWRegister::Mmio32 { page, offset } => {
                page.write32(*offset, value as u32);
                Ok(())
            }
            HWRegister::Mmio64 { page, offset } => {
                page.write64(*offset, value);
                Ok(())
            }
            HWRegister::Virtual(v) => {
                v.store(value, Ordering::Release);
                Ok(())
            }
            HWRegister::Perf(p) => p.lock().unwrap().write(value),
        }
    }
}

/// Dynamic-dispatch wrapper kept for collections that must mix `HWRegister`
/// with test doubles (e.g. the event-parser's callback-assembled synthetic
/// counters); the inventory itself stores `HWRegister` directly.
pub trait DynHWRegister: Send + Sync {
    fn read(&self) -> Result<u64>;
    fn write(&self, value: u64) -> Result<()>;
}

impl DynHWRegister for HWRegister {
    fn read(&self) -> Result<u64> {
        HWRegister::read(self)
    }
    fn write(&self, value: u64) -> Result<()> {
        HWRegister::write(self, value)
    }
}

/// Wraps a narrow-width hardware counter and exposes a monotonic virtual
/// 64-bit value, folding wraparounds in on a fixed watchdog cadence.
///
/// One extender per physical counter: sharing one between two counters would
/// corrupt both accumulators, since the wrap detection compares consecutive
/// raw reads of a single register.
pub struct CounterWidthExtender {
    width: u32,
    accumulator: Arc<AtomicU64>,
    last_raw: Arc<AtomicU64>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    watchdog: Option<std::thread::JoinHandle<()>>,
}

impl CounterWidthExtender {
    /// `width` is the hardware counter's bit width (24, 32 or 48).
    /// `watchdog_ms` must be strictly less than the shortest real time for
    /// the raw counter to wrap under the expected workload.
    pub fn start(
        register: Arc<dyn DynHWRegister>,
        width: u32,
        watchdog_ms: u64,
    ) -> Self {
        let accumulator = Arc::new(AtomicU64::new(0));
        let last_raw = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let acc = accumulator.clone();
        let last = last_raw.clone();
        let stop_flag = stop.clone();
        let reg = register.clone();
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(watchdog_ms));
                if let Ok(raw) = reg.read() {
                    fold_wraparound(&acc, &last, raw, width);
                }
            }
        });

        CounterWidthExtender { width, accumulator, last_raw, stop, watchdog: Some(handle) }
    }

    /// Reads the register directly (used in tests, where there is no live
    /// background thread) and folds it into the accumulator, returning the
    /// virtual value. This is the same fold logic the watchdog uses.
    pub fn sample(&self, raw: u64) -> u64 {
        fold_wraparound(&self.accumulator, &self.last_raw, raw, self.width);
        self.accumulator.load(Ordering::Acquire) + (raw & self.mask())
    }

    fn mask(&self) -> u64 {
        if self.width >= 64 { u64::MAX } else { (1u64 << self.width) - 1 }
    }

    /// Returns the accumulator plus the most recent raw delta, without
    /// triggering a hardware read itself — the watchdog thread owns reads.
    pub fn read(&self) -> u64 {
        self.accumulator.load(Ordering::Acquire) + self.last_raw.load(Ordering::Acquire)
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.watchdog.take() {
            let _ = h.join();
        }
    }
}

fn fold_wraparound(accumulator: &AtomicU64, last_raw: &AtomicU64, raw: u64, width: u32) {
    let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
    let raw = raw & mask;
    let prev = last_raw.swap(raw, Ordering::AcqRel);
    if raw < prev {
        let wrap = if width >= 64 { 0 } else { 1u64 << width };
        accumulator.fetch_add(wrap, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario 2 from spec.md §8: a width-32 counter sampled four times
    /// through a single wraparound.
    #[test]
    fn width_extender_folds_one_wraparound() {
        let accumulator = Arc::new(AtomicU64::new(0));
        let last_raw = Arc::new(AtomicU64::new(0));
        let width = 32u32;

        let raws: [u64; 4] = [0x0000_0000, 0xFFFF_F000, 0x0000_1000, 0x0000_2000];
        let mut virtual_values = Vec::new();
        for raw in raws {
            fold_wraparound(&accumulator, &last_raw, raw, width);
            virtual_values.push(accumulator.load(Ordering::Acquire) + raw);
        }

        assert_eq!(
            virtual_values,
            vec![0u64, 0xFFFF_F000, 0x1_0000_1000, 0x1_0000_2000]
        );
    }

    #[test]
    fn width_extender_never_decreases_within_one_wrap_period() {
        let accumulator = Arc::new(AtomicU64::new(0));
        let last_raw = Arc::new(AtomicU64::new(0));
        let width = 24u32;
        let mut previous = 0u64;
        for raw in [0u64, 1000, 1 << 23, (1 << 24) - 1, 5, 1000] {
            fold_wraparound(&accumulator, &last_raw, raw, width);
            let value = accumulator.load(Ordering::Acquire) + raw;
            assert!(value >= previous);
            previous = value;
        }
    }
}
