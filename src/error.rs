//! Error types for the RBLN NPU Operator
//!
//! Every reconcile path returns [`Result`]. The controllers map each error to
//! an [`ErrorAction`] that decides whether and when the object is requeued.

use kube::runtime::finalizer;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("API {api_version}/{kind} is not served by the cluster")]
    ApiNotServed { api_version: String, kind: String },

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<finalizer::Error<Error>>),

    // =========================================================================
    // Component Errors
    // =========================================================================
    #[error("Failed to patch component {component}: {source}")]
    ComponentPatch {
        component: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to clean up component {component}: {source}")]
    ComponentCleanUp {
        component: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Node selector conflict: {0}")]
    NodeSelectorConflict(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML serialize error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Another driver owns the nodes; wait for the operator to fix it
            Error::NodeSelectorConflict(_) => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Configuration errors - don't retry automatically
            Error::Configuration(_) | Error::ApiNotServed { .. } => ErrorAction::NoRequeue,

            Error::ComponentPatch { source, .. } | Error::ComponentCleanUp { source, .. } => {
                source.action()
            }

            Error::Finalizer(inner) => match inner.as_ref() {
                finalizer::Error::ApplyFailed(source) | finalizer::Error::CleanupFailed(source) => {
                    source.action()
                }
                _ => ErrorAction::RequeueWithBackoff,
            },

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(_) | Error::Io(_) => true,
            Error::ComponentPatch { source, .. } | Error::ComponentCleanUp { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Short label used for the failure metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Internal(_) => "internal",
            Error::Configuration(_) => "configuration",
            Error::Kube(_) => "kube",
            Error::ResourceNotFound { .. } => "not_found",
            Error::ApiNotServed { .. } => "api_not_served",
            Error::Finalizer(inner) => match inner.as_ref() {
                finalizer::Error::ApplyFailed(source) | finalizer::Error::CleanupFailed(source) => {
                    source.metric_label()
                }
                _ => "finalizer",
            },
            Error::ComponentPatch { .. } => "component_patch",
            Error::ComponentCleanUp { .. } => "component_clean_up",
            Error::NodeSelectorConflict(_) => "node_selector_conflict",
            Error::JsonParse(_) | Error::Yaml(_) => "serialization",
            Error::Io(_) => "io",
            Error::Metrics(_) => "metrics",
        }
    }

    /// Check if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    pub(crate) fn patch(component: &str, source: Error) -> Self {
        Error::ComponentPatch {
            component: component.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn clean_up(component: &str, source: Error) -> Self {
        Error::ComponentCleanUp {
            component: component.to_string(),
            source: Box::new(source),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
