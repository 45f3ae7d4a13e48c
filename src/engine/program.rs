//! Programming engine (spec.md §4.6): exclusivity check, NMI-watchdog
//! capture, per-core register writes dispatched through the worker pool,
//! per-socket uncore programming, and post-program corruption detection.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::engine::msr_addr::*;
use crate::error::{PcmError, Result};
use crate::pmu::inventory::Inventory;
use crate::topology::Topology;
use crate::transport::msr::SafeMsrHandle;
use crate::workerpool::WorkerPool;

/// One `IA32_PERFEVTSELx`-shaped general-purpose event configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawEventConfig {
    pub event_select: u8,
    pub umask: u8,
    pub usr: bool,
    pub os: bool,
    pub edge: bool,
    pub pin: bool,
    pub apic_int: bool,
    pub any_thread: bool,
    pub enable: bool,
    pub invert: bool,
    pub cmask: u8,
    pub in_tx: bool,
    pub in_txcp: bool,
}

impl RawEventConfig {
    pub fn encode(&self) -> u64 {
        let mut v: u64 = 0;
        v |= self.event_select as u64;
        v |= (self.umask as u64) << 8;
        v |= (self.usr as u64) << 16;
        v |= (self.os as u64) << 17;
        v |= (self.edge as u64) << 18;
        v |= (self.pin as u64) << 19;
        v |= (self.apic_int as u64) << 20;
        v |= (self.any_thread as u64) << 21;
        v |= (self.enable as u64) << 22;
        v |= (self.invert as u64) << 23;
        v |= (self.cmask as u64) << 24;
        v |= (self.in_tx as u64) << 32;
        v |= (self.in_txcp as u64) << 33;
        v
    }

    /// Whether this config matches the narrow NMI-watchdog signature the
    /// library looks for: `event_select==0x3C && umask==0` (cycles, no
    /// submask). SPEC_FULL.md open question 1 keeps this detection narrow
    /// rather than guessing at other watchdog profiles.
    pub fn looks_like_nmi_watchdog(&self) -> bool {
        self.event_select == 0x3C && self.umask == 0
    }
}

/// Fixed-counter control bits requested alongside the GP configs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedCounterConfig {
    pub os: bool,
    pub usr: bool,
    pub any_thread: bool,
    pub pmi: bool,
}

impl FixedCounterConfig {
    fn encode(&self, index: u32) -> u64 {
        let mut nibble: u64 = 0;
        nibble |= self.os as u64;
        nibble |= (self.usr as u64) << 1;
        nibble |= (self.any_thread as u64) << 2;
        nibble |= (self.pmi as u64) << 3;
        nibble << (index * 4)
    }
}

/// Side-band MSRs a core config may request alongside the event-select
/// registers proper.
#[derive(Debug, Clone, Default)]
pub struct SideBandMsrs {
    pub offcore_rsp0: Option<u64>,
    pub offcore_rsp1: Option<u64>,
    pub load_latency: Option<u64>,
    pub frontend: Option<u64>,
    pub pebs_enable_mask: Option<u64>,
}

/// One core's full programming request: fixed-counter control, a GP config
/// per counter index, and optional side-band MSRs.
#[derive(Debug, Clone, Default)]
pub struct CoreProgram {
    pub fixed: FixedCounterConfig,
    pub gp: Vec<RawEventConfig>,
    pub side_band: SideBandMsrs,
    pub enable_topdown: bool,
    pub enable_perf_metrics: bool,
}

/// Predefined bundles spec.md §4.6 names, plus an escape hatch for a raw
/// per-PMU-kind config map.
#[derive(Debug, Clone)]
pub enum ProgramMode {
    DefaultCache,
    ExtendedCustomCore(CoreProgram),
    PerSocketMemory,
    Power,
    Iio,
    Pcie,
    Qpi,
    Rdt,
    Custom(RawPMUConfigs),
}

/// A user-supplied configuration keyed by PMU kind name (`"core"`,
/// `"atom"`, `"cbo"`/`"cha"`, `"iio"`, `"imc"`, `"m2m"`, `"upi"`, `"pcu"`,
/// and so on, per spec.md §4.6).
pub type RawPMUConfigs = HashMap<String, Vec<RawEventConfig>>;

pub(crate) fn default_cache_program() -> CoreProgram {
    CoreProgram {
        fixed: FixedCounterConfig { os: true, usr: true, any_thread: false, pmi: false },
        gp: vec![
            RawEventConfig { event_select: 0x2E, umask: 0x4F, usr: true, os: true, enable: true, ..Default::default() },
            RawEventConfig { event_select: 0x2E, umask: 0x41, usr: true, os: true, enable: true, ..Default::default() },
        ],
        side_band: SideBandMsrs::default(),
        enable_topdown: false,
        enable_perf_metrics: false,
    }
}

fn mode_to_core_program(mode: &ProgramMode) -> Option<CoreProgram> {
    match mode {
        ProgramMode::DefaultCache => Some(default_cache_program()),
        ProgramMode::ExtendedCustomCore(cfg) => Some(cfg.clone()),
        ProgramMode::Custom(raw) => raw.get("core").map(|gp| CoreProgram {
            fixed: FixedCounterConfig { os: true, usr: true, any_thread: false, pmi: false },
            gp: gp.clone(),
            side_band: SideBandMsrs::default(),
            enable_topdown: false,
            enable_perf_metrics: false,
        }),
        ProgramMode::PerSocketMemory | ProgramMode::Power | ProgramMode::Iio | ProgramMode::Pcie | ProgramMode::Qpi | ProgramMode::Rdt => None,
    }
}

/// Which uncore PMU kinds a mode's raw configs (or built-in defaults)
/// target, and what to write to each counter's control register.
fn mode_to_uncore_programs(mode: &ProgramMode) -> HashMap<String, Vec<u64>> {
    let mut out = HashMap::new();
    match mode {
        ProgramMode::PerSocketMemory => {
            out.insert("imc".to_string(), vec![0x0304, 0x0404]);
        }
        ProgramMode::Qpi => {
            out.insert("upi".to_string(), vec![0x0204, 0x0304]);
        }
        ProgramMode::Iio => {
            out.insert("iio".to_string(), vec![0x0102, 0x0202]);
        }
        ProgramMode::Power => {
            // PCU profile: frequency-residency and clip-cycle event selects.
            out.insert("pcu".to_string(), vec![0x0112, 0x0212, 0x0312, 0x0412]);
        }
        ProgramMode::Pcie => {
            out.insert("pciegen5".to_string(), vec![0x0104, 0x0204]);
        }
        ProgramMode::Custom(raw) => {
            for (kind, cfgs) in raw {
                if kind == "core" || kind == "atom" {
                    continue;
                }
                let values: Vec<u64> = cfgs.iter().map(|c| c.encode()).collect();
                out.insert(kind.clone(), values);
            }
        }
        _ => {}
    }
    out
}

/// Result of the pre-program exclusivity scan on one core (spec.md §4.6
/// step 1): which GP counters are already in use, and whether the only
/// user is the kernel's own NMI watchdog.
#[derive(Debug, Clone, Default)]
pub struct ExclusivityReport {
    pub gp_in_use: Vec<bool>,
    pub nmi_watchdog_only: bool,
}

pub struct ProgramEngine {
    config: Config,
    pool: Arc<WorkerPool>,
    core_msrs: HashMap<i32, SafeMsrHandle>,
    num_gp_counters: u32,
    perf_global_inuse_supported: bool,
    /// The global-enable mask written on the last successful `program()`;
    /// every core must write this identical value (spec.md §4.6 step 4f).
    last_global_mask: Option<u64>,
}

impl ProgramEngine {
    pub fn new(topology: &Topology, config: Config, num_gp_counters: u32, perf_global_inuse_supported: bool) -> Result<Self> {
        let os_ids: Vec<i32> = topology.entries.iter().map(|e| e.os_id).collect();
        let pool = Arc::new(WorkerPool::new(&os_ids));
        let mut core_msrs = HashMap::new();
        for &os_id in &os_ids {
            core_msrs.insert(os_id, SafeMsrHandle::open(os_id, true)?);
        }
        Ok(ProgramEngine { config, pool, core_msrs, num_gp_counters, perf_global_inuse_supported, last_global_mask: None })
    }

    /// Step 1: scan every online core's `IA32_PERF_GLOBAL_INUSE` (when
    /// supported) and `IA32_PERFEVTSELx` registers. A counter already
    /// enabled by something other than the narrow NMI-watchdog signature
    /// is reported as in use.
    pub fn check_exclusivity(&self) -> Result<HashMap<i32, ExclusivityReport>> {
        let mut reports = HashMap::new();
        for (&os_id, msr) in &self.core_msrs {
            let mut gp_in_use = vec![false; self.num_gp_counters as usize];
            let mut nmi_watchdog_only = true;
            let inuse = if self.perf_global_inuse_supported {
                msr.read(IA32_PERF_GLOBAL_INUSE)?
            } else {
                0
            };
            for i in 0..self.num_gp_counters {
                let used_by_inuse_bit = self.perf_global_inuse_supported && (inuse >> i) & 1 == 1;
                let raw = msr.read(perfevtsel(i))?;
                let enabled = (raw >> 22) & 1 == 1;
                if used_by_inuse_bit || enabled {
                    let cfg = decode_evtsel(raw);
                    gp_in_use[i as usize] = true;
                    if !cfg.looks_like_nmi_watchdog() {
                        nmi_watchdog_only = false;
                    }
                }
            }
            reports.insert(os_id, ExclusivityReport { gp_in_use, nmi_watchdog_only });
        }
        Ok(reports)
    }

    /// Step 2: when the NMI watchdog looks like the sole occupant of a
    /// counter and `PCM_KEEP_NMI_WATCHDOG` is not set, disable it around
    /// programming by writing `/proc/sys/kernel/nmi_watchdog`, restoring it
    /// in `cleanup`.
    fn capture_nmi_watchdog(&self) -> Option<String> {
        if self.config.keep_nmi_watchdog {
            return None;
        }
        let previous = std::fs::read_to_string("/proc/sys/kernel/nmi_watchdog").ok()?;
        let _ = std::fs::write("/proc/sys/kernel/nmi_watchdog", "0");
        Some(previous)
    }

    fn restore_nmi_watchdog(&self, previous: Option<String>) {
        if let Some(value) = previous {
            let _ = std::fs::write("/proc/sys/kernel/nmi_watchdog", value.trim());
        }
    }

    /// Runs the full contract: exclusivity check, optional NMI capture,
    /// per-core dispatch, per-socket uncore programming.
    pub fn program(&mut self, mode: ProgramMode, inventory: &mut Inventory) -> Result<()> {
        if matches!(mode, ProgramMode::Rdt) {
            // RDT QoS monitoring is RMID assignment via IA32_PQR_ASSOC/resctrl,
            // not a freeze/program/enable uncore counter sequence; it has no
            // encoding in this model.
            return Err(PcmError::Unsupported("ProgramMode::Rdt is not a counter-programming mode; use the resctrl/RMID path".into()));
        }
        let reports = self.check_exclusivity()?;
        for (os_id, report) in &reports {
            if report.gp_in_use.iter().any(|&used| used) && !report.nmi_watchdog_only {
                return Err(PcmError::PmuBusy(format!("cpu {os_id} has GP counters already in use")));
            }
        }

        let watchdog_state = self.capture_nmi_watchdog();

        let core_program = mode_to_core_program(&mode);
        if let Some(program) = &core_program {
            self.program_cores(program)?;
        }

        self.program_uncore(&mode, inventory)?;

        self.restore_nmi_watchdog(watchdog_state);
        info!(mode = ?std::mem::discriminant(&mode), "programmed PMU");
        Ok(())
    }

    fn program_cores(&mut self, program: &CoreProgram) -> Result<()> {
        let pool = self.pool.clone();
        let core_msrs = self.core_msrs.clone();
        let num_gp = self.num_gp_counters;
        let program = program.clone();

        let global_mask = build_global_mask(num_gp, &program);
        self.last_global_mask = Some(global_mask);

        pool.broadcast(move |os_id| {
            let msr = core_msrs.get(&os_id).ok_or_else(|| PcmError::unknown("engine::program", format!("no MSR handle for cpu {os_id}")))?;
            msr.write(IA32_PERF_GLOBAL_CTRL, 0)?;
            msr.write(IA32_FIXED_CTR_CTRL, program.fixed.encode(0))?;
            for (i, cfg) in program.gp.iter().enumerate() {
                msr.write(perfevtsel(i as u32), cfg.encode())?;
            }
            if let Some(v) = program.side_band.offcore_rsp0 {
                msr.write(MSR_OFFCORE_RSP0, v)?;
            }
            if let Some(v) = program.side_band.offcore_rsp1 {
                msr.write(MSR_OFFCORE_RSP1, v)?;
            }
            if let Some(v) = program.side_band.load_latency {
                msr.write(MSR_PEBS_LD_LAT, v)?;
            }
            if let Some(v) = program.side_band.frontend {
                msr.write(MSR_FRONTEND, v)?;
            }
            if let Some(v) = program.side_band.pebs_enable_mask {
                msr.write(IA32_PEBS_ENABLE, v)?;
            }
            msr.write(IA32_PERF_GLOBAL_CTRL, global_mask)?;
            Ok(())
        })
    }

    fn program_uncore(&self, mode: &ProgramMode, inventory: &mut Inventory) -> Result<()> {
        let programs = mode_to_uncore_programs(mode);
        for pmu in inventory.uncore.iter_mut() {
            if let Some(values) = programs.get(pmu.kind.raw_config_key()) {
                pmu.init_freeze()?;
                pmu.program(values, &[])?;
                pmu.reset_unfreeze()?;
            }
        }
        Ok(())
    }

    /// Step 6: re-read every `IA32_PERFEVTSELx` on every core and compare
    /// to what was written (ignoring the apic-int bit, which perf may have
    /// flipped). Returns, per core, a bitmask of which GP counters were
    /// found corrupted.
    pub fn detect_corruption(&self, program: &CoreProgram) -> Result<HashMap<i32, Vec<bool>>> {
        const APIC_INT_BIT: u64 = 1 << 20;
        let mut out = HashMap::new();
        for (&os_id, msr) in &self.core_msrs {
            let mut corrupted = vec![false; program.gp.len()];
            for (i, cfg) in program.gp.iter().enumerate() {
                let expected = cfg.encode() | APIC_INT_BIT;
                let actual = msr.read(perfevtsel(i as u32))? | APIC_INT_BIT;
                if actual != expected {
                    corrupted[i] = true;
                    warn!(cpu = os_id, counter = i, "programming corruption detected");
                }
            }
            out.insert(os_id, corrupted);
        }
        Ok(out)
    }

    /// Disables the global counter-enable mask on every core and resets
    /// every programmed uncore PMU to idle.
    pub fn cleanup(&mut self, inventory: &mut Inventory) -> Result<()> {
        let core_msrs = self.core_msrs.clone();
        self.pool.broadcast(move |os_id| {
            if let Some(msr) = core_msrs.get(&os_id) {
                msr.write(IA32_PERF_GLOBAL_CTRL, 0)?;
            }
            Ok(())
        })?;
        for pmu in inventory.uncore.iter_mut() {
            pmu.cleanup()?;
        }
        self.last_global_mask = None;
        Ok(())
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn core_msr(&self, os_id: i32) -> Option<&SafeMsrHandle> {
        self.core_msrs.get(&os_id)
    }
}

fn decode_evtsel(raw: u64) -> RawEventConfig {
    RawEventConfig {
        event_select: raw as u8,
        umask: (raw >> 8) as u8,
        usr: (raw >> 16) & 1 == 1,
        os: (raw >> 17) & 1 == 1,
        edge: (raw >> 18) & 1 == 1,
        pin: (raw >> 19) & 1 == 1,
        apic_int: (raw >> 20) & 1 == 1,
        any_thread: (raw >> 21) & 1 == 1,
        enable: (raw >> 22) & 1 == 1,
        invert: (raw >> 23) & 1 == 1,
        cmask: (raw >> 24) as u8,
        in_tx: (raw >> 32) & 1 == 1,
        in_txcp: (raw >> 33) & 1 == 1,
    }
}

fn build_global_mask(num_gp: u32, program: &CoreProgram) -> u64 {
    let mut mask: u64 = 0;
    for i in 0..num_gp.min(program.gp.len() as u32) {
        if program.gp[i as usize].enable {
            mask |= 1 << i;
        }
    }
    // Fixed counters occupy bits 32..35 of IA32_PERF_GLOBAL_CTRL.
    mask |= 1 << 32;
    if program.enable_perf_metrics {
        mask |= 1 << 48;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_config_roundtrips_through_encode_decode() {
        let cfg = RawEventConfig {
            event_select: 0xC0,
            umask: 0x00,
            usr: true,
            os: true,
            enable: true,
            cmask: 3,
            ..Default::default()
        };
        let decoded = decode_evtsel(cfg.encode());
        assert_eq!(decoded, cfg);
    }

    #[test]
    fn nmi_watchdog_signature_is_narrow() {
        let watchdog = RawEventConfig { event_select: 0x3C, umask: 0, ..Default::default() };
        assert!(watchdog.looks_like_nmi_watchdog());
        let not_watchdog = RawEventConfig { event_select: 0x3C, umask: 1, ..Default::default() };
        assert!(!not_watchdog.looks_like_nmi_watchdog());
        let also_not = RawEventConfig { event_select: 0x2E, umask: 0, ..Default::default() };
        assert!(!also_not.looks_like_nmi_watchdog());
    }

    #[test]
    fn global_mask_sets_one_bit_per_enabled_gp_counter_plus_fixed() {
        let program = CoreProgram {
            gp: vec![
                RawEventConfig { enable: true, ..Default::default() },
                RawEventConfig { enable: false, ..Default::default() },
                RawEventConfig { enable: true, ..Default::default() },
            ],
            ..Default::default()
        };
        let mask = build_global_mask(4, &program);
        assert_eq!(mask & 0b111, 0b101);
        assert_eq!((mask >> 32) & 1, 1);
    }

    fn offline_engine(os_id: i32, num_gp: u32) -> ProgramEngine {
        let mut core_msrs = HashMap::new();
        core_msrs.insert(os_id, SafeMsrHandle::open(os_id, false).unwrap());
        ProgramEngine {
            config: Config::default(),
            pool: Arc::new(WorkerPool::new(&[])),
            core_msrs,
            num_gp_counters: num_gp,
            perf_global_inuse_supported: false,
            last_global_mask: None,
        }
    }

    /// A core with no programming applied (offline MSR handle, always
    /// reads zero) must report every GP counter free.
    #[test]
    fn exclusivity_check_finds_no_conflict_on_unprogrammed_core() {
        let engine = offline_engine(5, 4);
        let reports = engine.check_exclusivity().unwrap();
        let report = &reports[&5];
        assert!(report.gp_in_use.iter().all(|&used| !used));
        assert!(report.nmi_watchdog_only);
    }

    /// Scenario 5 from spec.md §8 (shape, not live-hardware content): a
    /// register that reads back differently from what was written is
    /// flagged corrupted rather than silently trusted. An offline MSR
    /// handle always reads 0, so any non-zero programmed config stands in
    /// for "something external changed the register".
    #[test]
    fn detect_corruption_flags_mismatched_readback() {
        let engine = offline_engine(7, 2);
        let program = CoreProgram {
            gp: vec![
                RawEventConfig { event_select: 0xC0, umask: 0, enable: true, ..Default::default() },
                RawEventConfig::default(),
            ],
            ..Default::default()
        };
        let corrupted = engine.detect_corruption(&program).unwrap();
        assert_eq!(corrupted[&7], vec![true, false]);
    }
}
