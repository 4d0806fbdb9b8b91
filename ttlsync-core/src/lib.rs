//! ttlsync core library
//!
//! Incremental synchronization of a Turtle knowledge graph into a remote
//! record platform. The pipeline is:
//!
//! graph → [`Normalizer`] → [`CanonicalDocument`] → [`Fingerprint`] per
//! (dataset, model) → [`DiffPlanner`] → [`PlatformUpdater`]
//!
//! The planner and the updater consult a [`SyncStateStore`], which holds the
//! fingerprint committed by the last successful sync of every group.

pub mod document;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod normalize;
pub mod plan;
pub mod platform;
pub mod resume;
pub mod run_log;
pub mod schema;
pub mod sqlite_state;
pub mod state;
pub mod updater;

pub use document::{canonical_json, CanonicalDocument, Record};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use graph::{Graph, GraphQuery, Term, Triple};
pub use normalize::{Normalized, Normalizer, ValidationIssue};
pub use plan::{classify, Classification, DiffPlanner, ModelDecision, PlanOptions, SyncPlan};
pub use platform::{
    AssignedId, BulkResult, OutgoingRecord, PlatformApi, RecordFailure, RecordLink,
};
pub use resume::ResumeJournal;
pub use run_log::{RunLog, RunLogEntry};
pub use schema::{LinkRule, Schema};
pub use sqlite_state::SqliteStateStore;
pub use state::{MemoryStateStore, StateEntry, SyncStateStore};
pub use updater::{
    FailureStage, ModelOutcome, ModelReport, PlatformUpdater, SyncReport, UpdaterOptions,
};
