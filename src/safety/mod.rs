//! Checked access helpers shared by the parsers.

pub mod raw;

pub use raw::{RawAccessError, RawReader};
