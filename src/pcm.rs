//! The `Pcm` context object: an owned replacement for the original
//! process-wide `PCM` singleton (spec.md §9 design note). Owns
//! configuration, topology, PMU inventory and the programming/sampling
//! engines; a thin [`global`] adaptor is kept only for legacy call sites
//! that still want one process-wide instance.

use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::program::{CoreProgram, ProgramEngine, ProgramMode};
use crate::engine::sample::SampleEngine;
use crate::error::{PcmError, Result};
use crate::pmu::inventory::Inventory;
use crate::pmu::tables::Uarch;
use crate::state::{CoreCounterState, SystemCounterState, UncoreCounterState};
use crate::topology::Topology;

/// Process-owned handle on a fully discovered and bound machine. Construct
/// one with [`Pcm::new`] and keep it alive for the duration of any
/// programming/sampling; dropping it does not itself reset hardware state,
/// call [`Pcm::cleanup`] first if that matters to the caller.
pub struct Pcm {
    config: Config,
    topology: Topology,
    inventory: Inventory,
    program_engine: ProgramEngine,
    last_program: Option<CoreProgram>,
    num_gp_counters: u32,
    has_topdown: bool,
}

impl Pcm {
    /// Runs topology discovery, PMU binding and engine construction. A
    /// failed discovery here is the only place the library surfaces a
    /// construction failure; every subsequent public call on a
    /// successfully constructed `Pcm` is expected to succeed or report a
    /// per-operation error rather than leaving the instance half-built.
    pub fn new() -> Result<Self> {
        let config = Config::from_env();
        let topology = Topology::discover(&config)?;

        if config.print_topology {
            for entry in &topology.entries {
                info!(
                    os_id = entry.os_id,
                    socket = entry.socket_id,
                    core = entry.core_id,
                    thread = entry.thread_id,
                    core_type = ?entry.core_type,
                    "topology entry"
                );
            }
        }

        let uarch = detect_uarch()?;
        let num_gp_counters = detect_num_gp_counters(&config);
        let has_topdown = detect_topdown_support();

        let inventory = Inventory::build(uarch, topology.num_sockets as u32, &[], &config, &topology)?;

        let perf_global_inuse_supported = detect_perf_global_inuse_support();
        let program_engine = ProgramEngine::new(&topology, config.clone(), num_gp_counters, perf_global_inuse_supported)?;

        Ok(Pcm {
            config,
            topology,
            inventory,
            program_engine,
            last_program: None,
            num_gp_counters,
            has_topdown,
        })
    }

    pub fn is_good(&self) -> bool {
        !self.topology.entries.is_empty()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn program(&mut self, mode: ProgramMode) -> Result<()> {
        if let ProgramMode::ExtendedCustomCore(cfg) = &mode {
            self.last_program = Some(cfg.clone());
        } else if matches!(mode, ProgramMode::DefaultCache) {
            self.last_program = Some(crate::engine::program::default_cache_program());
        }
        self.program_engine.program(mode, &mut self.inventory)
    }

    pub fn cleanup(&mut self) -> Result<()> {
        self.program_engine.cleanup(&mut self.inventory)
    }

    /// `getAllCounterStates`: spec.md §4.7's freeze/read/unfreeze/aggregate
    /// sequence, returning the system total, one state per socket, and one
    /// state per online core (keyed by OS logical id).
    pub fn sample_all(&mut self) -> Result<(SystemCounterState, Vec<UncoreCounterState>, Vec<(i32, CoreCounterState)>)> {
        let program = self.last_program.clone().unwrap_or_default();
        let sampler = SampleEngine::new(
            self.program_engine.pool().clone(),
            self.core_msr_map(),
            self.num_gp_counters,
            self.has_topdown,
        );
        sampler.sample_all(&self.topology, &mut self.inventory, &program)
    }

    /// Offline-core reads return an all-zero state rather than erroring
    /// (spec.md §8 boundary behaviour).
    pub fn core_counter_state(&mut self, os_id: i32) -> Result<CoreCounterState> {
        if self.topology.offline_os_ids.contains(&os_id) {
            return Ok(CoreCounterState::default());
        }
        let (_, _, cores) = self.sample_all()?;
        Ok(cores.into_iter().find(|(id, _)| *id == os_id).map(|(_, s)| s).unwrap_or_default())
    }

    fn core_msr_map(&self) -> std::collections::HashMap<i32, crate::transport::msr::SafeMsrHandle> {
        self.topology
            .entries
            .iter()
            .filter_map(|e| self.program_engine.core_msr(e.os_id).map(|m| (e.os_id, m.clone())))
            .collect()
    }
}

fn detect_uarch() -> Result<Uarch> {
    let family_model = crate::bits::cpuid(1, 0).eax;
    let family = crate::bits::extract_bits(family_model as u64, 8, 11);
    let model = crate::bits::extract_bits(family_model as u64, 4, 7) | (crate::bits::extract_bits(family_model as u64, 16, 19) << 4);
    if family != 6 {
        return Err(PcmError::Unsupported(format!("unrecognized CPU family {family}")));
    }
    let uarch = match model {
        0x2A | 0x2D | 0x3A | 0x3E => Uarch::SnbIvbJkt,
        0x3F | 0x4F | 0x56 => Uarch::HsxBdx,
        0x55 => Uarch::SkxClxCpx,
        0x6A | 0x6C | 0x8F => Uarch::Icx,
        0x8C | 0x8D => Uarch::Snr,
        0xCF | 0xAF => Uarch::SprEmr,
        0xA6 | 0xAA => Uarch::Grr,
        0xAD | 0xAE => Uarch::SrfGnr,
        0x1A | 0x1E | 0x2E => Uarch::NhmWsm,
        _ => Uarch::Client,
    };
    Ok(uarch)
}

/// `CPUID.0xA.EAX[15:8]`: number of general-purpose counters per logical
/// processor, capped at 3 under the AWS nested-virtualization workaround
/// unless disabled.
fn detect_num_gp_counters(config: &Config) -> u32 {
    let r = crate::bits::cpuid(0x0A, 0);
    let reported = crate::bits::extract_bits(r.eax as u64, 8, 15) as u32;
    let reported = if reported == 0 { 4 } else { reported };
    if !config.no_aws_workaround && is_running_on_aws() {
        reported.min(3)
    } else {
        reported
    }
}

fn is_running_on_aws() -> bool {
    std::fs::read_to_string("/sys/devices/virtual/dmi/id/sys_vendor")
        .map(|s| s.trim() == "Amazon EC2")
        .unwrap_or(false)
}

/// `CPUID.0xA.EAX[31:24]`: architectural perfmon version; version 4+
/// exposes `IA32_PERF_GLOBAL_INUSE`.
fn detect_perf_global_inuse_support() -> bool {
    let r = crate::bits::cpuid(0x0A, 0);
    crate::bits::extract_bits(r.eax as u64, 0, 7) >= 4
}

fn detect_topdown_support() -> bool {
    let r = crate::bits::cpuid(7, 0);
    crate::bits::extract_bits(r.edx as u64, 15, 15) == 1
}

static GLOBAL: OnceCell<Mutex<Option<Pcm>>> = OnceCell::new();

/// Thin adaptor for legacy call sites that want a single process-wide
/// instance rather than threading a `Pcm` through explicitly. Prefer
/// constructing and owning a `Pcm` directly in new code.
pub fn global() -> Result<&'static Mutex<Option<Pcm>>> {
    let cell = GLOBAL.get_or_init(|| Mutex::new(None));
    {
        let mut guard = cell.lock().unwrap();
        if guard.is_none() {
            match Pcm::new() {
                Ok(pcm) => *guard = Some(pcm),
                Err(e) => {
                    warn!(error = %e, "global PCM construction failed");
                    return Err(e);
                }
            }
        }
    }
    Ok(cell)
}
