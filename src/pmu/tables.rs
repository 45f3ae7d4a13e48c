//! Compile-time per-uarch discovery-fallback constants (spec.md §6): PCI
//! device/function numbers and base MSR addresses used for direct binding
//! when a PMU discovery capability table is unavailable or disabled.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uarch {
    NhmWsm,
    SnbIvbJkt,
    HsxBdx,
    SkxClxCpx,
    Icx,
    Snr,
    SprEmr,
    Grr,
    SrfGnr,
    Client,
}

/// Base MSR address for the first CHA/CBo box's unit-control register on a
/// given uarch. Per-box addresses are `base + box_index * stride`.
pub fn cha_base_msr(uarch: Uarch) -> Option<(u64, u64)> {
    // (base, stride)
    match uarch {
        Uarch::SnbIvbJkt => Some((0x0E00, 0x10)),
        Uarch::HsxBdx => Some((0x0E00, 0x10)),
        Uarch::SkxClxCpx => Some((0x0E00, 0x10)),
        Uarch::Icx => Some((0x0E00, 0x10)),
        Uarch::Snr => Some((0x0E00, 0x10)),
        Uarch::SprEmr => Some((0x0E00, 0x10)),
        Uarch::Grr | Uarch::SrfGnr => Some((0x0E00, 0x10)),
        Uarch::NhmWsm | Uarch::Client => None,
    }
}

/// Base MSR address for the PCU unit-control register.
pub fn pcu_base_msr(uarch: Uarch) -> Option<u64> {
    match uarch {
        Uarch::SnbIvbJkt | Uarch::HsxBdx | Uarch::SkxClxCpx | Uarch::Icx | Uarch::SprEmr => Some(0x0710),
        Uarch::Snr | Uarch::Grr | Uarch::SrfGnr => Some(0x0710),
        Uarch::NhmWsm | Uarch::Client => None,
    }
}

/// PCI device/function for the IMC channel PMUs, indexed by channel.
pub fn imc_pci_functions(uarch: Uarch) -> &'static [(u32, u32)] {
    // (device, function)
    match uarch {
        Uarch::HsxBdx => &[(0x0A, 2), (0x0A, 6), (0x0B, 2)],
        Uarch::SkxClxCpx => &[(0x0A, 2), (0x0A, 6), (0x0B, 2), (0x0C, 2), (0x0C, 6), (0x0D, 2)],
        Uarch::Icx => &[(0x0A, 0), (0x0A, 1), (0x0A, 2), (0x0A, 3), (0x0A, 4), (0x0A, 5)],
        _ => &[],
    }
}

/// PCI device/function for the UPI/QPI link-layer PMUs.
pub fn upi_pci_functions(uarch: Uarch) -> &'static [(u32, u32)] {
    match uarch {
        Uarch::SkxClxCpx => &[(0x0E, 1), (0x0E, 2), (0x0E, 5)],
        Uarch::Icx | Uarch::SprEmr => &[(0x01, 1), (0x01, 2), (0x01, 5)],
        _ => &[],
    }
}

/// PCI device/function for the M2M (mesh-to-memory / B2CMI) PMUs.
pub fn m2m_pci_functions(uarch: Uarch) -> &'static [(u32, u32)] {
    match uarch {
        Uarch::SkxClxCpx => &[(0x08, 0), (0x09, 0)],
        Uarch::Icx | Uarch::SprEmr => &[(0x0C, 0), (0x0D, 0)],
        _ => &[],
    }
}

/// Intel vendor id, constant across every uarch.
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// Known PCI device ids for IAA/DSA accelerators, used by the inventory to
/// scan config space for accelerator BARs.
pub fn idx_accelerator_device_ids() -> &'static [(u16, super::IdxAccelerator)] {
    use super::IdxAccelerator::*;
    &[(0x0CFE, Iaa), (0x0B25, Dsa), (0x4940, Qat)]
}

/// BAR0 offset of the IAA/DSA general capabilities register. Its bits
/// [23:8] hold the PMON register block's own BAR0 offset in 256-byte units,
/// since that block moves between generations.
pub const IDX_GENCAP_OFFSET: usize = 0x0;
