//! Job engine for firmware toolchain runs: a single worker executing queued
//! jobs one at a time, capturing their output and fanning it out to
//! observers.

pub mod buffer;
pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod normalize;
pub mod observe;
pub mod pipeline;
pub mod runner;
pub mod store;
pub mod util;
pub mod validate;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use job::{Job, JobEvent, Subscription};
pub use manager::JobManager;
pub use observe::{Attachment, TailResult};
