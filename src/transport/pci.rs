//! PCI configuration-space transport.
//!
//! Opens `/proc/bus/pci/SSSS:BB/DD.F` for config-space reads/writes; falls
//! back to mapping the MMCFG window (its base address taken from
//! `/sys/firmware/acpi/tables/MCFG`) via `/dev/mem` when the per-device proc
//! file is unavailable, as described in `original_source/src/pci.cpp`.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{PcmError, Result};
use crate::transport::mmio::MmioPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        PciAddress { segment, bus, device, function }
    }

    fn proc_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/proc/bus/pci/{:04x}:{:02x}/{:02x}.{:x}",
            self.segment, self.bus, self.device, self.function
        ))
    }
}

enum Backend {
    Proc(std::fs::File),
    Mmcfg(Arc<MmioPage>),
}

pub struct PciHandle {
    addr: PciAddress,
    backend: Backend,
}

impl PciHandle {
    /// Returns `false` for a non-Intel vendor id or an absent BDF, rather
    /// than erroring — callers use this to skip absent uncore blocks.
    pub fn exists(addr: PciAddress) -> bool {
        match Self::open(addr) {
            Ok(h) => h.vendor_device().map(|(v, _)| v == 0x8086).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn open(addr: PciAddress) -> Result<Self> {
        match OpenOptions::new().read(true).write(true).open(addr.proc_path()) {
            Ok(file) => Ok(PciHandle { addr, backend: Backend::Proc(file) }),
            Err(_) => Self::open_via_mmcfg(addr),
        }
    }

    fn open_via_mmcfg(addr: PciAddress) -> Result<Self> {
        let base = mmcfg_base(addr.segment)?;
        let offset = ((addr.bus as u64) << 20) | ((addr.device as u64) << 15) | ((addr.function as u64) << 12);
        let page = MmioPage::map(base + offset, 4096)?;
        Ok(PciHandle { addr, backend: Backend::Mmcfg(Arc::new(page)) })
    }

    pub fn vendor_device(&self) -> Result<(u16, u16)> {
        let v = self.read32(0x00)?;
        Ok(((v & 0xFFFF) as u16, (v >> 16) as u16))
    }

    pub fn read32(&self, offset: u32) -> Result<u32> {
        if offset % 4 != 0 {
            tracing::warn!(addr = ?self.addr, offset, "misaligned 32-bit pci config read");
        }
        match &self.backend {
            Backend::Proc(f) => {
                let mut buf = [0u8; 4];
                f.read_exact_at(&mut buf, offset as u64).map_err(io_err)?;
                Ok(u32::from_le_bytes(buf))
            }
            Backend::Mmcfg(page) => Ok(page.read32(offset as usize)),
        }
    }

    pub fn read64(&self, offset: u32) -> Result<u64> {
        if offset % 8 != 0 {
            tracing::warn!(addr = ?self.addr, offset, "misaligned 64-bit pci config read");
        }
        match &self.backend {
            Backend::Proc(f) => {
                let mut buf = [0u8; 8];
                f.read_exact_at(&mut buf, offset as u64).map_err(io_err)?;
                Ok(u64::from_le_bytes(buf))
            }
            Backend::Mmcfg(page) => Ok(page.read64(offset as usize)),
        }
    }

    pub fn write32(&self, offset: u32, value: u32) -> Result<()> {
        match &self.backend {
            Backend::Proc(f) => f.write_all_at(&value.to_le_bytes(), offset as u64).map_err(io_err),
            Backend::Mmcfg(page) => {
                page.write32(offset as usize, value);
                Ok(())
            }
        }
    }

    pub fn write64(&self, offset: u32, value: u64) -> Result<()> {
        match &self.backend {
            Backend::Proc(f) => f.write_all_at(&value.to_le_bytes(), offset as u64).map_err(io_err),
            Backend::Mmcfg(page) => {
                page.write64(offset as usize, value);
                Ok(())
            }
        }
    }
}

fn io_err(e: io::Error) -> PcmError {
    PcmError::unknown("pci", e.to_string())
}

/// Parse the MMCFG base address for `segment` out of the ACPI MCFG table.
fn mmcfg_base(segment: u16) -> Result<u64> {
    let raw = std::fs::read("/sys/firmware/acpi/tables/MCFG")
        .map_err(|e| PcmError::AccessDenied { transport: "mmcfg", context: e.to_string() })?;
    // MCFG: 36-byte ACPI header, then 8-byte-aligned reserved field, then
    // repeated 16-byte "Configuration Space Allocation" entries:
    // base(8) segment(2) start_bus(1) end_bus(1) reserved(4).
    let mut offset = 44usize;
    while offset + 16 <= raw.len() {
        let entry = &raw[offset..offset + 16];
        let base = u64::from_le_bytes(entry[0..8].try_into().unwrap());
        let seg = u16::from_le_bytes(entry[8..10].try_into().unwrap());
        if seg == segment {
            return Ok(base);
        }
        offset += 16;
    }
    Err(PcmError::Unsupported(format!("no MCFG entry for segment {segment}")))
}

/// Enumerate every `(bus, device, function)` whose vendor/device id pair
/// matches `(vendor, device)` by walking `/sys/bus/pci/devices`, the way
/// `lspci` does, rather than probing every BDF in `/proc/bus/pci`.
pub fn enumerate_by_id(vendor: u16, device: u16) -> Vec<PciAddress> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/bus/pci/devices") else {
        return found;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        let name = entry.file_name();
        let Some(addr) = parse_sysfs_bdf(&name.to_string_lossy()) else { continue };
        let v = read_hex_id(&dir.join("vendor"));
        let d = read_hex_id(&dir.join("device"));
        if v == Some(vendor) && d == Some(device) {
            found.push(addr);
        }
    }
    found
}

fn parse_sysfs_bdf(name: &str) -> Option<PciAddress> {
    // Format: "0000:bb:dd.f"
    let mut parts = name.split(':');
    let segment = u16::from_str_radix(parts.next()?, 16).ok()?;
    let bus = u8::from_str_radix(parts.next()?, 16).ok()?;
    let rest = parts.next()?;
    let mut rest_parts = rest.split('.');
    let device = u8::from_str_radix(rest_parts.next()?, 16).ok()?;
    let function = u8::from_str_radix(rest_parts.next()?, 16).ok()?;
    Some(PciAddress::new(segment, bus, device, function))
}

fn read_hex_id(path: &std::path::Path) -> Option<u16> {
    let s = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok()
}
