//! Indexing state machine and the per-user work loop.
//!
//! Each user gets a dedicated worker task that pulls messages oldest first
//! from a [`MessageSource`], decrypts them through a [`MessageDecrypter`],
//! writes them to the index within the storage budget and pauses or resumes
//! as device conditions and user commands require.

mod progress;
mod source;
mod state;
mod worker;

pub use progress::{EtaEstimator, IndexingProgress};
pub use source::{
    DecryptError, MessageDecrypter, MessageEvent, MessageRef, MessageSource, SourceError,
};
pub use state::{Advisory, IndexingState, PauseReason, SpeedMode};
pub(crate) use worker::{Command, Worker, WorkerContext, WorkerHandle};
