//! Event payloads exchanged between the pipeline components.
//!
//! Each payload is bound to the topic it is published on. Field names are
//! the wire names consumed by external collaborators.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use annoflow_core::{JobId, RetrievalId, UserId};

/// Topic names.
pub mod topics {
    /// Submission → annotation worker.
    pub const JOB_REQUESTS: &str = "job-requests";
    /// Annotation worker → notifier.
    pub const JOB_RESULTS: &str = "job-results";
    /// Annotation worker (delayed) → archiver.
    pub const ARCHIVE_ELIGIBILITY: &str = "archive-eligibility";
    /// Subscription management → thaw initiator.
    pub const TIER_UPGRADES: &str = "tier-upgrades";
    /// Cold tier → restorer.
    pub const RETRIEVAL_COMPLETIONS: &str = "retrieval-completions";

    pub const ALL: [&str; 5] = [
        JOB_REQUESTS,
        JOB_RESULTS,
        ARCHIVE_ELIGIBILITY,
        TIER_UPGRADES,
        RETRIEVAL_COMPLETIONS,
    ];
}

/// A payload that is published on a fixed topic.
pub trait PipelineEvent: Serialize + DeserializeOwned {
    const TOPIC: &'static str;
}

/// Request to run the annotation task for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequested {
    pub job_id: JobId,
    pub user_id: UserId,
    pub input_bucket: String,
    pub input_key: String,
    pub owner_email: String,
}

impl PipelineEvent for JobRequested {
    const TOPIC: &'static str = topics::JOB_REQUESTS;
}

/// A job finished; consumed by the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: JobId,
    /// Epoch seconds.
    pub complete_time: i64,
    pub result_url: String,
    pub owner_email: String,
    pub user_id: UserId,
}

impl PipelineEvent for JobCompleted {
    const TOPIC: &'static str = topics::JOB_RESULTS;
}

/// Delivered a fixed delay after completion: evaluate the job for archival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEligible {
    pub job_id: JobId,
    pub user_id: UserId,
}

impl PipelineEvent for ArchiveEligible {
    const TOPIC: &'static str = topics::ARCHIVE_ELIGIBILITY;
}

/// A user moved to the premium tier; their archived results must come back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierUpgraded {
    pub user_id: UserId,
}

impl PipelineEvent for TierUpgraded {
    const TOPIC: &'static str = topics::TIER_UPGRADES;
}

/// Final state of a cold-tier retrieval job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalStatus {
    Succeeded,
    Failed,
}

/// A cold-tier retrieval finished; `description` carries the job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalCompleted {
    pub retrieval_job_id: RetrievalId,
    pub description: String,
    pub status: RetrievalStatus,
}

impl PipelineEvent for RetrievalCompleted {
    const TOPIC: &'static str = topics::RETRIEVAL_COMPLETIONS;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_request_wire_shape() {
        let ev = JobRequested {
            job_id: JobId::parse("J1").unwrap(),
            user_id: UserId::parse("U1").unwrap(),
            input_bucket: "inputs".into(),
            input_key: "p/U1/J1~in.txt".into(),
            owner_email: "u1@example.com".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "job_id": "J1",
                "user_id": "U1",
                "input_bucket": "inputs",
                "input_key": "p/U1/J1~in.txt",
                "owner_email": "u1@example.com",
            })
        );
    }

    #[test]
    fn retrieval_completion_parses_status() {
        let ev: RetrievalCompleted = serde_json::from_value(serde_json::json!({
            "retrieval_job_id": "R1",
            "description": "J1",
            "status": "Succeeded",
        }))
        .unwrap();
        assert_eq!(ev.status, RetrievalStatus::Succeeded);
        assert_eq!(ev.description, "J1");
    }
}
