//! `cafetal-analysis`
//!
//! **Responsibility:** the boundary between the job queue and the analysis
//! work functions (pest classification, yield prediction, ...).
//!
//! This crate is intentionally **not** part of the scheduler:
//! - It knows nothing about storage, priorities or retries.
//! - Work functions receive an opaque payload and return a result or an error.
//! - New categories are added by registering a work function, never by editing
//!   the scheduler.

pub mod category;
pub mod context;
pub mod http;
pub mod registry;
pub mod result;
pub mod work;

pub use category::Category;
pub use context::WorkContext;
pub use http::HttpAnalysisWork;
pub use registry::WorkRegistry;
pub use result::{AnalysisError, AnalysisResult};
pub use work::{AnalysisInput, AnalysisWork, FnWork, work_fn};
