//! Verified saves.
//!
//! A save cycle collects the tracked changes, runs hooks and field
//! validation, checks each change against its operation rule, stages the
//! writes and then re-reads them through the select rules before
//! committing. Any failure rolls the whole cycle back.

mod hooks;
mod pipeline;
mod tracker;
mod validate;
mod verify;

pub use hooks::{HookContext, HookRegistry, MutationHooks, SaveScope};
pub use pipeline::{SaveOutcome, SavePipeline};
pub use tracker::{ChangeTracker, EntityHandle, EntityState, Link, PendingChange, TrackedEntity};
pub use validate::FieldValidator;
pub use verify::{VerificationKind, VerificationTask, Verifier};
