//! Loader error types

use std::io;
use std::path::PathBuf;

use crate::mm::MapError;
use crate::vcpu::VcpuError;

/// Result alias used throughout the loader.
pub type ExecResult<T> = Result<T, ExecError>;

/// Errors surfaced by the exec path.
///
/// None of these are retryable for the same input. Anything raised after the
/// first guest mapping leaves the guest address space in an undefined state,
/// so the caller must not resume the previous image.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("could not open file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid ELF image: {0}")]
    InvalidFormat(&'static str),

    #[error("unsupported ELF image (e_type={e_type:#x}, e_machine={machine:#x})")]
    UnsupportedType { e_type: u16, machine: u16 },

    #[error("guest mapping failed: {0}")]
    Map(#[from] MapError),

    #[error("failed to load interpreter {path:?}: {source}")]
    InterpLoad {
        path: PathBuf,
        #[source]
        source: Box<ExecError>,
    },

    #[error("argument and environment strings need {size} bytes, limit is {max}")]
    ArgumentsTooLarge { size: usize, max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("initial stack does not fit in the stack region")]
    StackOverflow,

    #[error("virtual CPU access failed: {0}")]
    Vcpu(#[from] VcpuError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ExecError {
    /// True when the failure happened before any guest state was touched.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            ExecError::Open { .. }
                | ExecError::InvalidFormat(_)
                | ExecError::UnsupportedType { .. }
                | ExecError::ArgumentsTooLarge { .. }
                | ExecError::InvalidArgument(_)
                | ExecError::Config(_)
        )
    }
}
