//! `IDX_PMU`: the accelerator variant of [`UncorePMU`](super::UncorePMU) for
//! Intel In-memory Analytics Accelerator (IAA), Data Streaming Accelerator
//! (DSA) and QuickAssist (QAT).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{PcmError, Result};
use crate::pmu::{CounterPair, IdxAccelerator};
use crate::transport::HWRegister;

/// One per-counter filter set: workqueue, engine, traffic-class, page-size,
/// transfer-size, as spec.md §3/§4.5 describe.
pub struct IdxFilters {
    pub workqueue: HWRegister,
    pub engine: HWRegister,
    pub traffic_class: HWRegister,
    pub page_size: HWRegister,
    pub transfer_size: HWRegister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdxMode {
    DirectMmio,
    LinuxPerf,
}

pub struct IdxPmu {
    pub accelerator: IdxAccelerator,
    pub socket: u32,
    pub mode: IdxMode,
    pub counters: Vec<CounterPair>,
    pub filters: Vec<IdxFilters>,
    /// QAT has no hardware counters; values are latched from a periodically
    /// refreshed sysfs telemetry text file. Stored as raw strings since not
    /// every line's value is numeric.
    telemetry: Option<Arc<std::sync::Mutex<HashMap<String, String>>>>,
    telemetry_path: Option<std::path::PathBuf>,
}

impl IdxPmu {
    pub fn new_hardware(
        accelerator: IdxAccelerator,
        socket: u32,
        mode: IdxMode,
        counters: Vec<CounterPair>,
        filters: Vec<IdxFilters>,
    ) -> Self {
        assert_ne!(accelerator, IdxAccelerator::Qat, "QAT has no hardware counters; use new_qat_telemetry");
        IdxPmu { accelerator, socket, mode, counters, filters, telemetry: None, telemetry_path: None }
    }

    pub fn new_qat_telemetry(socket: u32, telemetry_path: std::path::PathBuf) -> Self {
        IdxPmu {
            accelerator: IdxAccelerator::Qat,
            socket,
            mode: IdxMode::DirectMmio,
            counters: Vec::new(),
            filters: Vec::new(),
            telemetry: Some(Arc::new(std::sync::Mutex::new(HashMap::new()))),
            telemetry_path: Some(telemetry_path),
        }
    }

    pub fn read_counter(&self, index: usize) -> Result<u64> {
        self.counters[index].counter.read()
    }

    /// Re-reads the QAT telemetry control file and refreshes the cached
    /// key->value map. Schema is the documented `key: value` per line format
    /// of the in-tree `qat_4xxx`/`qat_c4xxx` telemetry control file; unknown
    /// or non-numeric values are kept in the map uninterpreted rather than
    /// dropped (SPEC_FULL.md open question 3), since `qat_raw` still needs
    /// to return them.
    pub fn refresh_qat_telemetry(&self) -> Result<()> {
        let path = self.telemetry_path.as_ref().ok_or_else(|| {
            PcmError::unknown("idx", "refresh_qat_telemetry called on a non-QAT PMU")
        })?;
        let text = std::fs::read_to_string(path)
            .map_err(|e| PcmError::AccessDenied { transport: "qat-telemetry", context: e.to_string() })?;
        let mut parsed = HashMap::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(':') {
                parsed.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        *self.telemetry.as_ref().unwrap().lock().unwrap() = parsed;
        Ok(())
    }

    /// The raw cached string for `key`, whether or not it parses as a number.
    pub fn qat_raw(&self, key: &str) -> Option<String> {
        self.telemetry.as_ref()?.lock().unwrap().get(key).cloned()
    }

    pub fn qat_value(&self, key: &str) -> Option<u64> {
        self.qat_raw(key)?.parse().ok()
    }

    /// Exposes one QAT telemetry value as a virtual [`HWRegister`], latched
    /// at the last `refresh_qat_telemetry` call.
    pub fn qat_virtual_register(&self, key: &str) -> HWRegister {
        let value = self.qat_value(key).unwrap_or(0);
        HWRegister::Virtual(Arc::new(AtomicU64::new(value)))
    }
}
