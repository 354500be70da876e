//! Loader logging
//!
//! The loader logs through the `log` facade using the same `k*!` macro family
//! the kernel uses, so call sites read the same in both trees. Output goes to
//! whatever logger the embedding hypervisor installed; [`init`] installs
//! `env_logger` for the standalone binary and for tests.
//!
//! `ktrace!` is compiled out unless the `debug_verbose` feature is enabled,
//! since the stack builder emits one trace line per push.

use std::sync::Once;

/// Log target shared by every loader message.
pub const TARGET: &str = "nexa_exec";

static INIT: Once = Once::new();

/// Install `env_logger` once, honouring `RUST_LOG`.
///
/// Defaults to `info` for the loader target when `RUST_LOG` is unset.
pub fn init() {
    INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or(format!("{}=info", TARGET));
        // Another logger may already be installed by the embedding process.
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_micros()
            .try_init();
    });
}

/// Install a logger for unit and integration tests.
///
/// Output is captured by the test harness.
pub fn init_for_tests() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(format!("{}=debug", TARGET)),
        )
        .is_test(true)
        .try_init();
    });
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        ::log::info!(target: $crate::logger::TARGET, $($arg)*)
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        ::log::warn!(target: $crate::logger::TARGET, $($arg)*)
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        ::log::error!(target: $crate::logger::TARGET, $($arg)*)
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        ::log::debug!(target: $crate::logger::TARGET, $($arg)*)
    };
}

#[cfg(feature = "debug_verbose")]
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {
        ::log::trace!(target: $crate::logger::TARGET, $($arg)*)
    };
}

#[cfg(not(feature = "debug_verbose"))]
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        if false {
            ::log::trace!(target: $crate::logger::TARGET, $($arg)*)
        }
    }};
}
