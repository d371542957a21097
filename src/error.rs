#![forbid(unsafe_code)]

//! Failure taxonomy of the download pipeline.
//!
//! Every variant is terminal for the job that hit it. Persistence hiccups
//! during progress reporting are deliberately absent: they are logged and
//! attached to the job as warnings instead of failing it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// The video row disappeared between enqueue and claim.
    #[error("entity not found")]
    NotFound,

    /// A collaborator the pipeline depends on is not usable.
    #[error("{0}")]
    Misconfigured(String),

    /// Looking the entity up failed for a reason other than absence.
    #[error("entity lookup failed: {0:#}")]
    Lookup(anyhow::Error),

    #[error("download failed: {0:#}")]
    Fetch(anyhow::Error),

    #[error("upload failed: {0:#}")]
    Upload(anyhow::Error),

    /// A lifecycle write the outcome depends on (entering `downloading`,
    /// recording the stored object) did not land.
    #[error("recording download state failed: {0:#}")]
    Persist(anyhow::Error),
}

impl JobError {
    /// Whether the persisted entity should be flagged as failed for this error.
    pub fn touches_entity(&self) -> bool {
        !matches!(self, JobError::NotFound)
    }
}
