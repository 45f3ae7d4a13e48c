//! Sampling engine (spec.md §4.7): freeze-all / per-core-read /
//! unfreeze-all coherent snapshot protocol, aggregation, and the stateless
//! delta helpers re-exported from [`crate::state`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::msr_addr::*;
use crate::engine::program::CoreProgram;
use crate::error::Result;
use crate::pmu::inventory::Inventory;
use crate::state::{CoreCounterState, SystemCounterState, TopdownSlots, UncoreCounterState};
use crate::topology::Topology;
use crate::transport::msr::SafeMsrHandle;
use crate::workerpool::WorkerPool;

pub struct SampleEngine {
    pool: Arc<WorkerPool>,
    core_msrs: HashMap<i32, SafeMsrHandle>,
    num_gp_counters: u32,
    has_topdown: bool,
}

impl SampleEngine {
    pub fn new(
        pool: Arc<WorkerPool>,
        core_msrs: HashMap<i32, SafeMsrHandle>,
        num_gp_counters: u32,
        has_topdown: bool,
    ) -> Self {
        SampleEngine { pool, core_msrs, num_gp_counters, has_topdown }
    }

    /// The full `getAllCounterStates` contract: freeze every uncore PMU,
    /// read every core (in parallel, through the worker pool), read each
    /// socket's uncore counters on its reference core, unfreeze, and
    /// aggregate socket/system totals.
    pub fn sample_all(
        &self,
        topology: &Topology,
        inventory: &mut Inventory,
        program: &CoreProgram,
    ) -> Result<(SystemCounterState, Vec<UncoreCounterState>, Vec<(i32, CoreCounterState)>)> {
        for pmu in inventory.uncore.iter_mut() {
            pmu.freeze()?;
        }

        let cores = self.sample_cores(program)?;

        let mut socket_states = Vec::with_capacity(topology.num_sockets);
        for socket in 0..topology.num_sockets as u32 {
            let mut state = UncoreCounterState::default();
            for pmu in inventory.uncore.iter().filter(|p| p.socket == socket) {
                for (i, _) in pmu.counters.iter().enumerate() {
                    let value = pmu.read_counter(i)?;
                    *state.raw_pcicfg.entry(format!("{}:{}:{}", pmu.kind.raw_config_key(), pmu.die, i)).or_insert(0) += value;
                }
            }
            socket_states.push(state);
        }

        for pmu in inventory.uncore.iter_mut() {
            pmu.unfreeze()?;
        }

        let mut system = SystemCounterState::default();
        for s in &socket_states {
            system.uncore = std::mem::take(&mut system.uncore) + s.clone();
        }

        Ok((system, socket_states, cores))
    }

    /// Step 2: per-core read dispatched across the worker pool. Each
    /// worker reads `IA32_PERF_GLOBAL_STATUS`, the fixed and GP counters,
    /// optionally `PERF_METRICS`/`TOPDOWN_SLOTS` (zeroing them after read),
    /// clears overflow bits, then reads TSC/C-state/thermal/SMI.
    fn sample_cores(&self, program: &CoreProgram) -> Result<Vec<(i32, CoreCounterState)>> {
        let core_msrs = self.core_msrs.clone();
        let num_gp = self.num_gp_counters;
        let has_topdown = self.has_topdown && program.enable_topdown;
        let enable_perf_metrics = program.enable_perf_metrics;

        self.pool.broadcast_collect(move |os_id| {
            let msr = match core_msrs.get(&os_id) {
                Some(m) => m,
                None => return Ok(CoreCounterState::default()),
            };

            let overflow = msr.read(IA32_PERF_GLOBAL_STATUS)?;

            let invariant_tsc = msr.read(IA32_TSC)?;
            let fixed0 = msr.read(IA32_FIXED_CTR0)?;
            let fixed1 = msr.read(IA32_FIXED_CTR0 + 1)?;
            let fixed2 = msr.read(IA32_FIXED_CTR0 + 2)?;

            let mut gp_counters = Vec::with_capacity(num_gp as usize);
            let mut corrupted = Vec::with_capacity(num_gp as usize);
            for i in 0..num_gp {
                gp_counters.push(msr.read(pmc(i))?);
                corrupted.push(false);
            }

            let mut topdown = TopdownSlots::default();
            if has_topdown || enable_perf_metrics {
                let metrics = msr.read(MSR_PERF_METRICS)?;
                let slots = msr.read(IA32_FIXED_CTR3)?;
                topdown = decode_topdown(metrics, slots);
                msr.write(MSR_PERF_METRICS, 0)?;
                msr.write(IA32_FIXED_CTR3, 0)?;
            }

            msr.write(IA32_PERF_GLOBAL_OVF_CTRL, overflow)?;

            let smi_count = msr.read(MSR_SMI_COUNT)?;
            let thermal_raw = msr.read(IA32_THERM_STATUS)?;
            let thermal_headroom = crate::state::get_thermal_headroom(thermal_raw);

            let mut c_state_residency = HashMap::new();
            c_state_residency.insert(3u32, msr.read(MSR_CORE_C3_RESIDENCY)?);
            c_state_residency.insert(6u32, msr.read(MSR_CORE_C6_RESIDENCY)?);
            c_state_residency.insert(7u32, msr.read(MSR_CORE_C7_RESIDENCY)?);

            Ok(CoreCounterState {
                invariant_tsc,
                instructions_retired: fixed0,
                core_cycles_unhalted: fixed1,
                reference_cycles_unhalted: fixed2,
                gp_counters,
                corrupted,
                topdown,
                c_state_residency,
                smi_count,
                thermal_headroom,
                user_msrs: HashMap::new(),
                l3_occupancy: 0,
            })
        })
    }
}

fn decode_topdown(metrics: u64, slots: u64) -> TopdownSlots {
    let pct = |shift: u32| -> u64 {
        let fraction = crate::bits::extract_bits(metrics, shift, shift + 7);
        (fraction * slots) >> 8
    };
    TopdownSlots {
        retiring: pct(0),
        bad_speculation: pct(8),
        frontend_bound: pct(16),
        backend_bound: pct(24),
        l2_fetch_latency: pct(32),
        l2_branch_mispredict: pct(40),
        l2_mem_bound: pct(48),
        l2_heavy_operations: pct(56),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topdown_buckets_sum_to_slots_within_rounding() {
        let slots = 1_000_000u64;
        // frontend 25%, bad-spec 10%, backend 40%, retiring 25% (scaled to 0..255).
        let metrics = (64u64) | (26u64 << 8) | (102u64 << 16) | (64u64 << 24);
        let td = decode_topdown(metrics, slots);
        let sum = td.retiring + td.bad_speculation + td.frontend_bound + td.backend_bound;
        assert!(sum <= slots);
        assert!(sum > slots * 90 / 100);
    }
}
