//! Programming and sampling engines: the two operations that actually talk
//! to hardware once topology discovery and PMU binding are done.

pub mod program;
pub mod sample;

/// Well-known core MSR addresses shared by both engines.
pub(crate) mod msr_addr {
    pub const IA32_PERFEVTSEL0: u32 = 0x186;
    pub const IA32_PMC0: u32 = 0x0C1;
    pub const IA32_FIXED_CTR0: u32 = 0x309;
    pub const IA32_FIXED_CTR_CTRL: u32 = 0x38D;
    pub const IA32_PERF_GLOBAL_STATUS: u32 = 0x38E;
    pub const IA32_PERF_GLOBAL_CTRL: u32 = 0x38F;
    pub const IA32_PERF_GLOBAL_OVF_CTRL: u32 = 0x390;
    pub const IA32_PERF_GLOBAL_INUSE: u32 = 0x392;
    pub const MSR_OFFCORE_RSP0: u32 = 0x1A6;
    pub const MSR_OFFCORE_RSP1: u32 = 0x1A7;
    pub const MSR_PEBS_LD_LAT: u32 = 0x3F6;
    pub const MSR_FRONTEND: u32 = 0x3F7;
    pub const IA32_PEBS_ENABLE: u32 = 0x3F1;
    pub const MSR_PERF_METRICS: u32 = 0x329;
    /// `TOPDOWN.SLOTS`, fixed counter 3.
    pub const IA32_FIXED_CTR3: u32 = IA32_FIXED_CTR0 + 3;
    pub const IA32_TSC: u32 = 0x10;
    pub const MSR_SMI_COUNT: u32 = 0x34;
    pub const IA32_THERM_STATUS: u32 = 0x19C;
    pub const IA32_PACKAGE_THERM_STATUS: u32 = 0x1B1;
    pub const MSR_CORE_C3_RESIDENCY: u32 = 0x3FC;
    pub const MSR_CORE_C6_RESIDENCY: u32 = 0x3FD;
    pub const MSR_CORE_C7_RESIDENCY: u32 = 0x3FE;
    pub const MSR_PKG_C2_RESIDENCY: u32 = 0x60D;
    pub const MSR_PKG_C3_RESIDENCY: u32 = 0x3F8;
    pub const MSR_PKG_C6_RESIDENCY: u32 = 0x3F9;
    pub const MSR_PKG_ENERGY_STATUS: u32 = 0x611;
    pub const MSR_DRAM_ENERGY_STATUS: u32 = 0x619;

    pub fn perfevtsel(counter: u32) -> u32 {
        IA32_PERFEVTSEL0 + counter
    }

    pub fn pmc(counter: u32) -> u32 {
        IA32_PMC0 + counter
    }
}
