//! The PMU resource model: a generic uncore register file plus the
//! accelerator-specific `IDX_PMU` variant, and the inventory that binds one
//! instance per hardware block per socket/die.

pub mod idx;
pub mod inventory;
pub mod tables;

use std::sync::Arc;

use crate::error::Result;
use crate::transport::HWRegister;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmuKind {
    Cha,
    Iio,
    Irp,
    M2m,
    Imc,
    Pcu,
    Ubox,
    Upi,
    M3upi,
    Mdf,
    Edc,
    Idx,
    Cxl(CxlUnit),
    PcieGen5,
}

impl PmuKind {
    pub fn raw_config_key(self) -> &'static str {
        match self {
            PmuKind::Cha => "cha",
            PmuKind::Iio => "iio",
            PmuKind::Irp => "irp",
            PmuKind::M2m => "m2m",
            PmuKind::Imc => "imc",
            PmuKind::Pcu => "pcu",
            PmuKind::Ubox => "ubox",
            PmuKind::Upi => "upi",
            PmuKind::M3upi => "m3upi",
            PmuKind::Mdf => "mdf",
            PmuKind::Edc => "edc",
            PmuKind::Idx => "idx",
            PmuKind::Cxl(CxlUnit::CommonManager) => "cxlcm",
            PmuKind::Cxl(CxlUnit::DataPath) => "cxldp",
            PmuKind::PcieGen5 => "pciegen5",
        }
    }
}

/// Whether a PMU instance's addresses came from a compile-time table or
/// from walking a live discovery capability structure. Surfaced through
/// [`UncorePMU::binding`] so tests can assert which path was taken
/// (spec.md §9 design note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Direct,
    Discovery,
}

/// State machine spec.md §3 describes for every uncore PMU:
/// `idle -> frozen -> configured -> running -> frozen -> idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuState {
    Idle,
    Frozen,
    Configured,
    Running,
}

/// One general-purpose control/counter register pair.
pub struct CounterPair {
    pub control: HWRegister,
    pub counter: HWRegister,
}

/// A small fixed register file shared by CHA/CBo, IIO, IRP, M2M, IMC, PCU,
/// UBOX, UPI, M3UPI and MDF: an optional unit-control register, N
/// general-purpose control/counter pairs, an optional fixed counter, and up
/// to two filters. Modeling every block as one generic struct (rather than
/// fourteen near-identical bespoke ones) is the "polymorphic hardware
/// register" generalization spec.md §9 calls for, pushed one level further
/// than the original per-block C++ classes.
pub struct UncorePMU {
    pub kind: PmuKind,
    pub socket: u32,
    pub die: u32,
    pub binding: BindingKind,
    pub unit_control: Option<HWRegister>,
    pub counters: Vec<CounterPair>,
    pub fixed_control: Option<HWRegister>,
    pub fixed_counter: Option<HWRegister>,
    pub filters: Vec<HWRegister>,
    state: PmuState,
}

/// Bits of a typical unit-control register (freeze/reset/enable), shared
/// across the direct-binding uarch tables.
bitflags::bitflags! {
    pub struct UnitControlFlags: u32 {
        const FREEZE        = 1 << 8;
        const RESET_COUNTERS = 1 << 1;
        const RESET_CONTROL  = 1 << 0;
    }
}

impl UncorePMU {
    pub fn new(
        kind: PmuKind,
        socket: u32,
        die: u32,
        binding: BindingKind,
        unit_control: Option<HWRegister>,
        counters: Vec<CounterPair>,
        fixed_control: Option<HWRegister>,
        fixed_counter: Option<HWRegister>,
        filters: Vec<HWRegister>,
    ) -> Self {
        UncorePMU {
            kind,
            socket,
            die,
            binding,
            unit_control,
            counters,
            fixed_control,
            fixed_counter,
            filters,
            state: PmuState::Idle,
        }
    }

    pub fn state(&self) -> PmuState {
        self.state
    }

    pub fn binding(&self) -> BindingKind {
        self.binding
    }

    /// `initFreeze`: freeze the box and reset its control registers.
    pub fn init_freeze(&mut self) -> Result<()> {
        if let Some(ctrl) = &self.unit_control {
            ctrl.write((UnitControlFlags::FREEZE | UnitControlFlags::RESET_CONTROL).bits() as u64)?;
        }
        self.state = PmuState::Frozen;
        Ok(())
    }

    /// Writes every control register (event selects + filters) then leaves
    /// the box in `Configured` state, still frozen.
    pub fn program(&mut self, event_selects: &[u64], filter_values: &[u64]) -> Result<()> {
        for (pair, value) in self.counters.iter().zip(event_selects) {
            pair.control.write(*value)?;
        }
        for (reg, value) in self.filters.iter().zip(filter_values) {
            reg.write(*value)?;
        }
        self.state = PmuState::Configured;
        Ok(())
    }

    /// `resetUnfreeze`: zero every counter register, then clear freeze.
    pub fn reset_unfreeze(&mut self) -> Result<()> {
        for pair in &self.counters {
            pair.counter.write(0)?;
        }
        if let Some(fixed) = &self.fixed_counter {
            fixed.write(0)?;
        }
        if let Some(ctrl) = &self.unit_control {
            ctrl.write(UnitControlFlags::RESET_COUNTERS.bits() as u64)?;
        }
        self.state = PmuState::Running;
        Ok(())
    }

    pub fn freeze(&mut self) -> Result<()> {
        if let Some(ctrl) = &self.unit_control {
            ctrl.write(UnitControlFlags::FREEZE.bits() as u64)?;
        }
        self.state = PmuState::Frozen;
        Ok(())
    }

    pub fn unfreeze(&mut self) -> Result<()> {
        if let Some(ctrl) = &self.unit_control {
            ctrl.write(0)?;
        }
        self.state = PmuState::Running;
        Ok(())
    }

    /// `cleanup`: zero every control and counter register and return to idle.
    pub fn cleanup(&mut self) -> Result<()> {
        for pair in &self.counters {
            pair.control.write(0)?;
            pair.counter.write(0)?;
        }
        if let Some(fixed_ctrl) = &self.fixed_control {
            fixed_ctrl.write(0)?;
        }
        if let Some(fixed) = &self.fixed_counter {
            fixed.write(0)?;
        }
        for reg in &self.filters {
            reg.write(0)?;
        }
        if let Some(ctrl) = &self.unit_control {
            ctrl.write(0)?;
        }
        self.state = PmuState::Idle;
        Ok(())
    }

    pub fn read_counter(&self, index: usize) -> Result<u64> {
        self.counters[index].counter.read()
    }
}

/// Accelerator family for an [`idx::IdxPmu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdxAccelerator {
    Iaa,
    Dsa,
    Qat,
}

/// The two PMUs exposed by a CXL endpoint, carried by `PmuKind::Cxl` so each
/// is keyed separately (`"cxlcm"`/`"cxldp"`) in `RawPMUConfigs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CxlUnit {
    CommonManager,
    DataPath,
}

pub(crate) fn virtual_register(initial: u64) -> HWRegister {
    HWRegister::Virtual(Arc::new(std::sync::atomic::AtomicU64::new(initial)))
}
