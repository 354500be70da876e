//! Loader configuration
//!
//! Guest stack placement and argument limits. The defaults mirror the layout
//! the hypervisor uses when no configuration file is given; a TOML file may
//! override any subset of the fields:
//!
//! ```toml
//! stack_top = 0x7ffffffff000
//! stack_size = 0x800000
//! max_arg_bytes = 0x200000
//! dyn_load_bias = 0x555555554000
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, ExecResult};
use crate::process::PAGE_SIZE;

/// Highest guest address of the initial stack region (exclusive).
pub const DEFAULT_STACK_TOP: u64 = 0x0000_7fff_ffff_f000;
/// Size of the initial stack region.
pub const DEFAULT_STACK_SIZE: u64 = 0x80_0000;
/// Upper bound on the combined argv + envp string bytes (Linux ARG_MAX scale).
pub const DEFAULT_MAX_ARG_BYTES: u64 = 0x20_0000;
/// Load bias for position-independent (ET_DYN) main executables.
pub const DEFAULT_DYN_LOAD_BIAS: u64 = 0x5555_5555_4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecConfig {
    /// Guest address one past the top of the stack; also the initial RBP.
    pub stack_top: u64,
    /// Size of the stack mapping below `stack_top`.
    pub stack_size: u64,
    /// Largest argument blob accepted by the stack builder.
    pub max_arg_bytes: u64,
    /// Where an ET_DYN main image is placed.
    pub dyn_load_bias: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            stack_top: DEFAULT_STACK_TOP,
            stack_size: DEFAULT_STACK_SIZE,
            max_arg_bytes: DEFAULT_MAX_ARG_BYTES,
            dyn_load_bias: DEFAULT_DYN_LOAD_BIAS,
        }
    }
}

impl ExecConfig {
    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(text: &str) -> ExecResult<Self> {
        let config: ExecConfig =
            toml::from_str(text).map_err(|e| ExecError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML configuration file.
    pub fn load(path: &Path) -> ExecResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ExecError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Lowest guest address of the stack region.
    pub fn stack_base(&self) -> u64 {
        self.stack_top - self.stack_size
    }

    pub fn validate(&self) -> ExecResult<()> {
        let mask = PAGE_SIZE - 1;
        if self.stack_top & mask != 0 {
            return Err(ExecError::Config(format!(
                "stack_top {:#x} is not page aligned",
                self.stack_top
            )));
        }
        if self.stack_size == 0 || self.stack_size & mask != 0 {
            return Err(ExecError::Config(format!(
                "stack_size {:#x} must be a non-zero multiple of the page size",
                self.stack_size
            )));
        }
        if self.stack_size > self.stack_top {
            return Err(ExecError::Config(format!(
                "stack_size {:#x} exceeds stack_top {:#x}",
                self.stack_size, self.stack_top
            )));
        }
        if self.dyn_load_bias & mask != 0 {
            return Err(ExecError::Config(format!(
                "dyn_load_bias {:#x} is not page aligned",
                self.dyn_load_bias
            )));
        }
        // The pointer tables and auxv sit below the strings, so the blob alone
        // must leave room in the region.
        if self.max_arg_bytes >= self.stack_size {
            return Err(ExecError::Config(format!(
                "max_arg_bytes {:#x} does not fit in a {:#x} byte stack",
                self.max_arg_bytes, self.stack_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ExecConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stack_base(), DEFAULT_STACK_TOP - DEFAULT_STACK_SIZE);
    }

    #[test]
    fn toml_overrides_subset_of_fields() {
        let config = ExecConfig::from_toml_str("stack_size = 0x100000\nmax_arg_bytes = 0x8000\n")
            .expect("valid config");
        assert_eq!(config.stack_top, DEFAULT_STACK_TOP);
        assert_eq!(config.stack_size, 0x100000);
        assert_eq!(config.max_arg_bytes, 0x8000);
    }

    #[test]
    fn unaligned_stack_top_is_rejected() {
        let err = ExecConfig::from_toml_str("stack_top = 0x7fff0001").unwrap_err();
        assert!(matches!(err, ExecError::Config(_)));
    }

    #[test]
    fn arg_limit_must_fit_in_stack() {
        let config = ExecConfig {
            stack_size: 0x1000,
            max_arg_bytes: 0x1000,
            ..ExecConfig::default()
        };
        assert!(matches!(config.validate(), Err(ExecError::Config(_))));
    }

    #[test]
    fn unaligned_dyn_bias_is_rejected() {
        let err = ExecConfig::from_toml_str("dyn_load_bias = 0x555555554123").unwrap_err();
        assert!(matches!(err, ExecError::Config(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ExecConfig::from_toml_str("heap_size = 4096").is_err());
    }

    #[test]
    fn load_reports_missing_file_as_open_error() {
        let err = ExecConfig::load(Path::new("/nonexistent/nexa-exec.toml")).unwrap_err();
        assert!(matches!(err, ExecError::Open { .. }));
    }
}
