//! Batch Job Actor (C9): one actor per `jobId`, a durable capability
//! token lifecycle, throttled persistence, and an alarm-driven cleanup
//! path, fronted by [`registry::JobRegistry`].

pub mod actor;
pub mod cancel;
pub mod registry;
pub mod store;
pub mod token;

pub use actor::{ItemOutcomeUpdate, StreamAttachment};
pub use cancel::CancellationToken;
pub use registry::{JobHandle, JobRegistry, LaunchOutcome};
pub use store::{FileJobStore, JobStore, StoreError};
