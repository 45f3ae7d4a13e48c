//! Error type returned by every fallible public operation.
//!
//! Mirrors the error kinds a consumer needs to distinguish (`AccessDenied`,
//! `PMUBusy`, `MSRAccessDenied`, `Unsupported`) plus an `Unknown` catch-all
//! that carries a component tag and a human-readable cause instead of
//! printing straight to stderr.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PcmError {
    #[error("access denied opening {transport} ({context})")]
    AccessDenied { transport: &'static str, context: String },

    #[error("PMU busy: {0}")]
    PmuBusy(String),

    #[error("MSR access denied on cpu {cpu}")]
    MsrAccessDenied { cpu: i32 },

    #[error("logical cpu {0} is offline")]
    Offline(i32),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{component}: {cause}")]
    Unknown { component: &'static str, cause: String },
}

impl PcmError {
    pub fn unknown(component: &'static str, cause: impl Into<String>) -> Self {
        PcmError::Unknown { component, cause: cause.into() }
    }
}

pub type Result<T> = std::result::Result<T, PcmError>;
