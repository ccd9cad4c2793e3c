//! Process-wide tracing setup shared by the cafetal binaries.

pub mod tracing;

pub use crate::tracing::{LogFormat, init, init_with};
