//! Shared error type for the ingestion and chat pipeline.
//!
//! Every stage of the pipeline reports failures through [`PipelineError`].
//! The variants mirror the error taxonomy of the system: fetch/extraction
//! failures are fatal for a training run, provider failures carry a
//! transient-vs-fatal distinction, moderation refusals and concurrency-guard
//! rejections are policy outcomes rather than faults.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The source URL could not be fetched (network error, HTTP error status).
    #[error("failed to fetch source: {0}")]
    Fetch(String),

    /// The fetched document could not be turned into usable text.
    #[error("failed to extract content: {0}")]
    Extract(String),

    /// Extraction succeeded but splitting produced zero sections.
    #[error("document produced no sections")]
    EmptyDocument,

    /// A call to the language-model provider failed.
    ///
    /// `transient` is `true` for rate limits, 5xx responses, and transport
    /// errors; callers may retry those. Malformed requests and responses are
    /// fatal.
    #[error("provider request failed: {message}")]
    Provider { message: String, transient: bool },

    /// The vector store rejected or failed an operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// A required setting is missing or unparseable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The token encoder could not be constructed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// A referenced project or link does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    /// A training run was requested while one is already in flight.
    ///
    /// This is the concurrency-guard rejection: a benign "already in
    /// progress" outcome, not a fault requiring operator action.
    #[error("link {0} is already training")]
    AlreadyTraining(Uuid),

    /// A link cannot be deleted while a training run holds it.
    #[error("link {0} is currently training")]
    LinkBusy(Uuid),

    /// The user message was flagged by the moderation check.
    #[error("message flagged by moderation")]
    Flagged,
}

impl PipelineError {
    /// Returns `true` when retrying the failed call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider { transient: true, .. })
    }

    pub(crate) fn project_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "project",
            id,
        }
    }

    pub(crate) fn link_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "link", id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let rate_limited = PipelineError::Provider {
            message: "429 Too Many Requests".into(),
            transient: true,
        };
        assert!(rate_limited.is_transient());

        let bad_input = PipelineError::Provider {
            message: "400 Bad Request".into(),
            transient: false,
        };
        assert!(!bad_input.is_transient());
        assert!(!PipelineError::Flagged.is_transient());
    }

    #[test]
    fn not_found_names_the_entity() {
        let id = Uuid::new_v4();
        let err = PipelineError::link_not_found(id);
        assert_eq!(err.to_string(), format!("link {id} not found"));
    }
}
