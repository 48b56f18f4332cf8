//! # Otto Core
//!
//! Shared foundation for the Otto automation runtime: the job/run/audit/outbound
//! data model, configuration, the error taxonomy, and the trait seams that
//! connect the scheduling core to its collaborators (persistence, execution
//! engine, chat transport).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::OttoConfig;
pub use error::{OttoError, Result};
pub use types::{now_ms, EpochMs};
