//! `cafetal-core`: shared building blocks for the analysis job queue.
//!
//! This crate holds the **pure** primitives every other crate agrees on
//! (identifiers, priorities, the job status state machine, time). It has no
//! storage or runtime concerns.

pub mod clock;
pub mod error;
pub mod id;
pub mod priority;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{SchedulerId, WorkItemId};
pub use priority::Priority;
pub use status::WorkStatus;
