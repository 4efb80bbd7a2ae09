//! Archival job records.
//!
//! The storage backend reports jobs as [`BackendJob`], which knows nothing about
//! the log database a snapshot came from. Everything we persist or hand back to
//! a caller is a [`JobRecord`]: the backend job with the source `db_address`
//! stitched in. The address is a required field, so a record without one
//! cannot be constructed.

use serde::{Deserialize, Serialize};

use crate::id::{Cid, DbAddress, JobId};

/// Job execution status as reported by the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted, waiting for the backend to pick it up
    Queued,
    /// Hot and/or cold storage in progress
    Executing,
    /// Storage configuration fully applied
    Success,
    /// Gave up; see `err_cause` and `deal_errors`
    Failed,
    /// Cancelled by the backend or an operator
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Executing => "EXECUTING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by one of the underlying storage deals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealError {
    pub proposal_cid: String,
    pub miner: String,
    pub message: String,
}

/// Job status exactly as the storage backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendJob {
    pub id: JobId,
    pub cid: Cid,
    pub status: JobStatus,
    #[serde(default)]
    pub err_cause: String,
    #[serde(default, rename = "dealErrorsList")]
    pub deal_errors: Vec<DealError>,
}

/// One archival job as tracked by the job registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub cid: Cid,
    pub db_address: DbAddress,
    pub status: JobStatus,
    #[serde(default)]
    pub err_cause: String,
    #[serde(default, rename = "dealErrorsList")]
    pub deal_errors: Vec<DealError>,
}

impl JobRecord {
    /// Attach the source database address to a backend-reported job.
    pub fn stitch(job: BackendJob, db_address: DbAddress) -> Self {
        Self {
            id: job.id,
            cid: job.cid,
            db_address,
            status: job.status,
            err_cause: job.err_cause,
            deal_errors: job.deal_errors,
        }
    }

    /// Fold a fresh backend report into this record.
    ///
    /// Returns `None` when the reported status matches the recorded one, so
    /// callers can skip the write entirely. The recorded `db_address` always
    /// survives.
    pub fn reconcile(&self, fresh: BackendJob) -> Option<Self> {
        if fresh.status == self.status {
            return None;
        }
        Some(Self::stitch(fresh, self.db_address.clone()))
    }
}
