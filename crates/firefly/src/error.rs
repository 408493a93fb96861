//! Orchestrator error taxonomy.
//!
//! Every fatal failure surfaces as one of these variants, with the underlying
//! collaborator error preserved as the source. The orchestrator emits an
//! `error` event before returning any of them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FireflyError {
    /// The provider refused or failed the allocation. Nothing was created,
    /// so there is nothing to clean up.
    #[error("provisioning failed: {source}")]
    Provision {
        #[source]
        source: anyhow::Error,
    },

    /// Persisting the instance record failed. The just-provisioned server
    /// has already been handed a best-effort terminate by the time this
    /// surfaces.
    #[error("store write failed for instance '{instance_id}': {source}")]
    StoreWrite {
        instance_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A store read or status update failed.
    #[error("store operation failed: {source}")]
    Store {
        #[source]
        source: anyhow::Error,
    },

    /// The instance never reported ready within the bounded poll window.
    /// It has been marked terminated and handed a best-effort terminate.
    #[error("instance '{instance_id}' not ready after {timeout_secs}s")]
    ReadyTimeout {
        instance_id: String,
        timeout_secs: u64,
    },

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    /// Provider-side termination failed during fade. The instance is left
    /// in `terminating`, never falsely marked terminated.
    #[error("termination failed for instance '{instance_id}': {source}")]
    Terminate {
        instance_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The provider could not enumerate its active instances for a sweep.
    #[error("provider listing failed: {source}")]
    List {
        #[source]
        source: anyhow::Error,
    },

    /// A consumer lifecycle hook failed. The state transition it follows
    /// has already committed; see the crate docs on hook failure semantics.
    #[error("{phase} hook failed for instance '{instance_id}': {source}")]
    Hook {
        phase: &'static str,
        instance_id: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type FireflyResult<T> = Result<T, FireflyError>;
