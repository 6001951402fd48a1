//! `annoflow-core`: job lifecycle domain.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job record, user subscription tiers, and the conditional
//! transitions every store must apply atomically.

pub mod error;
pub mod id;
pub mod job;
pub mod lifecycle;
pub mod user;

pub use error::{DomainError, DomainResult};
pub use id::{ArchiveId, JobId, RetrievalId, UserId};
pub use job::{Job, JobStatus, ObjectRef};
pub use lifecycle::{Condition, ConditionalUpdate, Mutation, Transition};
pub use user::{SubscriptionTier, UserProfile};
