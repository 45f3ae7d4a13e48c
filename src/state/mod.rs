//! Snapshot types returned by the sampling engine and the stateless
//! delta/aggregation functions over them (spec.md §3, §4.7, §4.8).

use std::collections::HashMap;
use std::ops::{Add, AddAssign};

/// Sentinel returned for an invalid QoS (RDT occupancy/bandwidth) reading —
/// set when bit 62 or 63 of the raw MSR is set.
pub const PCM_INVALID_QOS_MONITORING_DATA: u64 = u64::MAX;

/// Sentinel returned when the thermal-status MSR's "reading valid" bit
/// (bit 31) is clear.
pub const PCM_INVALID_THERMAL_HEADROOM: i32 = -1;

/// Sentinel a corrupted counter (spec.md §4.6 step 6 / §8 scenario 5) is
/// replaced with in subsequent reads.
pub const PCM_CORRUPTED_COUNTER: u64 = u64::MAX;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopdownSlots {
    pub frontend_bound: u64,
    pub bad_speculation: u64,
    pub backend_bound: u64,
    pub retiring: u64,
    pub l2_mem_bound: u64,
    pub l2_fetch_latency: u64,
    pub l2_branch_mispredict: u64,
    pub l2_heavy_operations: u64,
}

impl Add for TopdownSlots {
    type Output = TopdownSlots;
    fn add(self, rhs: TopdownSlots) -> TopdownSlots {
        TopdownSlots {
            frontend_bound: self.frontend_bound + rhs.frontend_bound,
            bad_speculation: self.bad_speculation + rhs.bad_speculation,
            backend_bound: self.backend_bound + rhs.backend_bound,
            retiring: self.retiring + rhs.retiring,
            l2_mem_bound: self.l2_mem_bound + rhs.l2_mem_bound,
            l2_fetch_latency: self.l2_fetch_latency + rhs.l2_fetch_latency,
            l2_branch_mispredict: self.l2_branch_mispredict + rhs.l2_branch_mispredict,
            l2_heavy_operations: self.l2_heavy_operations + rhs.l2_heavy_operations,
        }
    }
}

/// Per-thread snapshot (spec.md §3 `CoreCounterState`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreCounterState {
    pub invariant_tsc: u64,
    pub instructions_retired: u64,
    pub core_cycles_unhalted: u64,
    pub reference_cycles_unhalted: u64,
    pub gp_counters: Vec<u64>,
    /// Per-counter corruption flag (spec.md §4.6 step 6): `true` means the
    /// value in `gp_counters` at the same index is [`PCM_CORRUPTED_COUNTER`].
    pub corrupted: Vec<bool>,
    pub topdown: TopdownSlots,
    pub c_state_residency: HashMap<u32, u64>,
    pub smi_count: u64,
    pub thermal_headroom: i32,
    pub user_msrs: HashMap<u64, u64>,
    pub l3_occupancy: u64,
}

impl CoreCounterState {
    pub fn gp_counter(&self, index: usize) -> u64 {
        if self.corrupted.get(index).copied().unwrap_or(false) {
            PCM_CORRUPTED_COUNTER
        } else {
            self.gp_counters.get(index).copied().unwrap_or(0)
        }
    }
}

impl Add for CoreCounterState {
    type Output = CoreCounterState;
    fn add(self, rhs: CoreCounterState) -> CoreCounterState {
        let gp_counters = zip_add(&self.gp_counters, &rhs.gp_counters);
        let corrupted = zip_or(&self.corrupted, &rhs.corrupted);
        let mut c_state_residency = self.c_state_residency.clone();
        for (k, v) in &rhs.c_state_residency {
            *c_state_residency.entry(*k).or_insert(0) += v;
        }
        let mut user_msrs = self.user_msrs.clone();
        for (k, v) in &rhs.user_msrs {
            *user_msrs.entry(*k).or_insert(0) += v;
        }
        CoreCounterState {
            invariant_tsc: self.invariant_tsc.max(rhs.invariant_tsc),
            instructions_retired: self.instructions_retired + rhs.instructions_retired,
            core_cycles_unhalted: self.core_cycles_unhalted + rhs.core_cycles_unhalted,
            reference_cycles_unhalted: self.reference_cycles_unhalted + rhs.reference_cycles_unhalted,
            gp_counters,
            corrupted,
            topdown: self.topdown + rhs.topdown,
            c_state_residency,
            smi_count: self.smi_count + rhs.smi_count,
            thermal_headroom: sentinel_min(self.thermal_headroom, rhs.thermal_headroom, PCM_INVALID_THERMAL_HEADROOM),
            user_msrs,
            l3_occupancy: sentinel_sum_u64(self.l3_occupancy, rhs.l3_occupancy, PCM_INVALID_QOS_MONITORING_DATA),
        }
    }
}

impl AddAssign for CoreCounterState {
    fn add_assign(&mut self, rhs: CoreCounterState) {
        *self = std::mem::take(self) + rhs;
    }
}

/// Per-socket snapshot aggregating uncore reads (spec.md §3
/// `UncoreCounterState`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UncoreCounterState {
    pub imc_reads: u64,
    pub imc_writes: u64,
    pub pmm_reads: u64,
    pub pmm_writes: u64,
    pub near_memory_hits: u64,
    pub near_memory_misses: u64,
    pub link_flits_in: u64,
    pub link_flits_out: u64,
    pub link_l0_cycles: u64,
    pub link_l1_cycles: u64,
    pub home_agent_requests: u64,
    pub home_agent_local_requests: u64,
    pub uncore_clocks: u64,
    pub energy_package: u64,
    pub energy_dram: u64,
    pub uncore_freq_status: HashMap<u32, u64>,
    pub cxl_reads: u64,
    pub cxl_writes_mem: u64,
    pub cxl_writes_cache: u64,
    pub iio_stack_counters: HashMap<u32, Vec<u64>>,
    pub irp_stack_counters: HashMap<u32, Vec<u64>>,
    pub raw_pcicfg: HashMap<String, u64>,
    pub raw_mmio: HashMap<String, u64>,
    pub raw_msr: HashMap<u64, u64>,
}

impl Add for UncoreCounterState {
    type Output = UncoreCounterState;
    fn add(self, rhs: UncoreCounterState) -> UncoreCounterState {
        let mut uncore_freq_status = self.uncore_freq_status.clone();
        for (k, v) in &rhs.uncore_freq_status {
            uncore_freq_status.insert(*k, *v);
        }
        let mut iio_stack_counters = self.iio_stack_counters.clone();
        for (k, v) in &rhs.iio_stack_counters {
            let entry = iio_stack_counters.entry(*k).or_insert_with(|| vec![0; v.len()]);
            for (a, b) in entry.iter_mut().zip(v) {
                *a += b;
            }
        }
        let mut irp_stack_counters = self.irp_stack_counters.clone();
        for (k, v) in &rhs.irp_stack_counters {
            let entry = irp_stack_counters.entry(*k).or_insert_with(|| vec![0; v.len()]);
            for (a, b) in entry.iter_mut().zip(v) {
                *a += b;
            }
        }
        let mut raw_pcicfg = self.raw_pcicfg.clone();
        for (k, v) in &rhs.raw_pcicfg {
            *raw_pcicfg.entry(k.clone()).or_insert(0) += v;
        }
        let mut raw_mmio = self.raw_mmio.clone();
        for (k, v) in &rhs.raw_mmio {
            *raw_mmio.entry(k.clone()).or_insert(0) += v;
        }
        let mut raw_msr = self.raw_msr.clone();
        for (k, v) in &rhs.raw_msr {
            *raw_msr.entry(*k).or_insert(0) += v;
        }
        UncoreCounterState {
            imc_reads: self.imc_reads + rhs.imc_reads,
            imc_writes: self.imc_writes + rhs.imc_writes,
            pmm_reads: self.pmm_reads + rhs.pmm_reads,
            pmm_writes: self.pmm_writes + rhs.pmm_writes,
            near_memory_hits: self.near_memory_hits + rhs.near_memory_hits,
            near_memory_misses: self.near_memory_misses + rhs.near_memory_misses,
            link_flits_in: self.link_flits_in + rhs.link_flits_in,
            link_flits_out: self.link_flits_out + rhs.link_flits_out,
            link_l0_cycles: self.link_l0_cycles + rhs.link_l0_cycles,
            link_l1_cycles: self.link_l1_cycles + rhs.link_l1_cycles,
            home_agent_requests: self.home_agent_requests + rhs.home_agent_requests,
            home_agent_local_requests: self.home_agent_local_requests + rhs.home_agent_local_requests,
            uncore_clocks: self.uncore_clocks + rhs.uncore_clocks,
            energy_package: self.energy_package + rhs.energy_package,
            energy_dram: self.energy_dram + rhs.energy_dram,
            uncore_freq_status,
            cxl_reads: self.cxl_reads + rhs.cxl_reads,
            cxl_writes_mem: self.cxl_writes_mem + rhs.cxl_writes_mem,
            cxl_writes_cache: self.cxl_writes_cache + rhs.cxl_writes_cache,
            iio_stack_counters,
            irp_stack_counters,
            raw_pcicfg,
            raw_mmio,
            raw_msr,
        }
    }
}

impl AddAssign for UncoreCounterState {
    fn add_assign(&mut self, rhs: UncoreCounterState) {
        *self = std::mem::take(self) + rhs;
    }
}

/// System-wide snapshot: socket states summed, plus QPI/UPI per-port flit
/// counters (spec.md §3 `SystemCounterState`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemCounterState {
    pub uncore: UncoreCounterState,
    pub qpi_upi_flits: HashMap<(u32, u32), u64>,
    pub raw_pcicfg: HashMap<String, u64>,
    pub raw_mmio: HashMap<String, u64>,
    pub raw_msr: HashMap<u64, u64>,
}

impl Add for SystemCounterState {
    type Output = SystemCounterState;
    fn add(self, rhs: SystemCounterState) -> SystemCounterState {
        let mut qpi_upi_flits = self.qpi_upi_flits.clone();
        for (k, v) in &rhs.qpi_upi_flits {
            *qpi_upi_flits.entry(*k).or_insert(0) += v;
        }
        let mut raw_pcicfg = self.raw_pcicfg.clone();
        for (k, v) in &rhs.raw_pcicfg {
            *raw_pcicfg.entry(k.clone()).or_insert(0) += v;
        }
        let mut raw_mmio = self.raw_mmio.clone();
        for (k, v) in &rhs.raw_mmio {
            *raw_mmio.entry(k.clone()).or_insert(0) += v;
        }
        let mut raw_msr = self.raw_msr.clone();
        for (k, v) in &rhs.raw_msr {
            *raw_msr.entry(*k).or_insert(0) += v;
        }
        SystemCounterState {
            uncore: self.uncore + rhs.uncore,
            qpi_upi_flits,
            raw_pcicfg,
            raw_mmio,
            raw_msr,
        }
    }
}

impl AddAssign for SystemCounterState {
    fn add_assign(&mut self, rhs: SystemCounterState) {
        *self = std::mem::take(self) + rhs;
    }
}

fn zip_add(a: &[u64], b: &[u64]) -> Vec<u64> {
    let len = a.len().max(b.len());
    (0..len).map(|i| a.get(i).copied().unwrap_or(0) + b.get(i).copied().unwrap_or(0)).collect()
}

fn zip_or(a: &[bool], b: &[bool]) -> Vec<bool> {
    let len = a.len().max(b.len());
    (0..len).map(|i| a.get(i).copied().unwrap_or(false) || b.get(i).copied().unwrap_or(false)).collect()
}

fn sentinel_min(a: i32, b: i32, sentinel: i32) -> i32 {
    if a == sentinel || b == sentinel { sentinel } else { a.min(b) }
}

fn sentinel_sum_u64(a: u64, b: u64, sentinel: u64) -> u64 {
    if a == sentinel || b == sentinel { sentinel } else { a + b }
}

/// Delta of one general-purpose/fixed counter between two snapshots.
/// Returns 0 if either side is the corrupted sentinel, per spec.md §8
/// "Round-trip / idempotence".
pub fn get_number_of_events(before: u64, after: u64) -> u64 {
    if before == PCM_CORRUPTED_COUNTER || after == PCM_CORRUPTED_COUNTER {
        return 0;
    }
    after.saturating_sub(before)
}

pub fn get_instructions_retired(before: &CoreCounterState, after: &CoreCounterState) -> u64 {
    after.instructions_retired.saturating_sub(before.instructions_retired)
}

pub fn get_cycles(before: &CoreCounterState, after: &CoreCounterState) -> u64 {
    after.core_cycles_unhalted.saturating_sub(before.core_cycles_unhalted)
}

pub fn get_invariant_tsc_delta(before: &CoreCounterState, after: &CoreCounterState) -> u64 {
    after.invariant_tsc.saturating_sub(before.invariant_tsc)
}

pub fn get_qos_occupancy(raw: u64) -> u64 {
    if raw & (0b11 << 62) != 0 {
        PCM_INVALID_QOS_MONITORING_DATA
    } else {
        raw
    }
}

pub fn get_thermal_headroom(status_msr: u64) -> i32 {
    if (status_msr >> 31) & 1 == 0 {
        PCM_INVALID_THERMAL_HEADROOM
    } else {
        crate::bits::extract_bits(status_msr, 16, 22) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupted_counter_delta_is_zero() {
        assert_eq!(get_number_of_events(10, PCM_CORRUPTED_COUNTER), 0);
        assert_eq!(get_number_of_events(PCM_CORRUPTED_COUNTER, 20), 0);
        assert_eq!(get_number_of_events(10, 25), 15);
    }

    #[test]
    fn qos_sentinel_on_reserved_bits() {
        assert_eq!(get_qos_occupancy(1 << 63), PCM_INVALID_QOS_MONITORING_DATA);
        assert_eq!(get_qos_occupancy(1 << 62), PCM_INVALID_QOS_MONITORING_DATA);
        assert_eq!(get_qos_occupancy(42), 42);
    }

    #[test]
    fn thermal_sentinel_when_invalid_bit_clear() {
        assert_eq!(get_thermal_headroom(0), PCM_INVALID_THERMAL_HEADROOM);
        let valid = (1u64 << 31) | (5 << 16);
        assert_eq!(get_thermal_headroom(valid), 5);
    }

    #[test]
    fn socket_sum_is_associative_over_core_states() {
        let mut a = CoreCounterState::default();
        a.instructions_retired = 100;
        a.gp_counters = vec![1, 2, 3];
        let mut b = CoreCounterState::default();
        b.instructions_retired = 50;
        b.gp_counters = vec![4, 5, 6];
        let sum = a + b;
        assert_eq!(sum.instructions_retired, 150);
        assert_eq!(sum.gp_counters, vec![5, 7, 9]);
    }
}
