//! Process-wide configuration read once from the environment.
//!
//! Replaces the scattered `getenv` calls the original implementation makes
//! throughout topology discovery, inventory binding and the programming
//! engine with a single struct built at [`Pcm`](crate::pcm::Pcm) construction
//! time and threaded through by shared reference.

use std::env;

fn flag(name: &str) -> bool {
    matches!(env::var(name).as_deref(), Ok("1"))
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `PCM_NO_PERF=1`: forces direct core programming.
    pub no_perf: bool,
    /// `PCM_USE_UNCORE_PERF=1`: forces perf transport for uncore PMUs.
    pub use_uncore_perf: bool,
    /// `PCM_NO_RDT=1`: disables RDT (QoS) metrics.
    pub no_rdt: bool,
    /// `PCM_ENFORCE_MBM=1`: overrides the SKX-SKZ4 MBM erratum check.
    pub enforce_mbm: bool,
    /// `PCM_KEEP_NMI_WATCHDOG=1`: skip the automatic watchdog/unwatchdog dance.
    pub keep_nmi_watchdog: bool,
    /// `PCM_NO_AWS_WORKAROUND=1`: disables the 3-GP-counter AWS cap.
    pub no_aws_workaround: bool,
    /// `PCM_IGNORE_ARCH_PERFMON=1`: force-continue on a hypervisor lacking arch_perfmon.
    pub ignore_arch_perfmon: bool,
    /// `PCM_USE_RESCTRL=1`: forces the resctrl RDT backend over RMID MSRs.
    pub use_resctrl: bool,
    /// `PCM_NO_PCIE_GEN5_DISCOVERY=1`
    pub no_pcie_gen5_discovery: bool,
    /// `PCM_NO_IMC_DISCOVERY=1`
    pub no_imc_discovery: bool,
    /// `PCM_NO_UPILL_DISCOVERY=1`
    pub no_upi_discovery: bool,
    /// `PCM_PRINT_TOPOLOGY=1`: emit the topology table to stderr on init.
    pub print_topology: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            no_perf: flag("PCM_NO_PERF"),
            use_uncore_perf: flag("PCM_USE_UNCORE_PERF"),
            no_rdt: flag("PCM_NO_RDT"),
            enforce_mbm: flag("PCM_ENFORCE_MBM"),
            keep_nmi_watchdog: flag("PCM_KEEP_NMI_WATCHDOG"),
            no_aws_workaround: flag("PCM_NO_AWS_WORKAROUND"),
            ignore_arch_perfmon: flag("PCM_IGNORE_ARCH_PERFMON"),
            use_resctrl: flag("PCM_USE_RESCTRL"),
            no_pcie_gen5_discovery: flag("PCM_NO_PCIE_GEN5_DISCOVERY"),
            no_imc_discovery: flag("PCM_NO_IMC_DISCOVERY"),
            no_upi_discovery: flag("PCM_NO_UPILL_DISCOVERY"),
            print_topology: flag("PCM_PRINT_TOPOLOGY"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env()
    }
}
