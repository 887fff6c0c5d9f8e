//! Controller is the core of the hook operator.
//!
//! The [`manager::HookManager`] discovers hooks, asks each one for its configuration, and routes
//! events to the hooks that declared a binding for them. Webhook configuration objects in the
//! cluster are kept in sync by the managers in [`webhooks`].

// Re-exports for everyone's easy use.
pub(crate) mod prelude {
    pub use api::{BindingType, DEFAULT_CONFIGURATION_ID};
    pub use k8s_openapi::api::*;
    pub use kube::{
        self, Resource, ResourceExt,
        api::{Api, ListParams, Patch, PatchParams, PostParams},
    };
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use super::{Diagnostic, Error, Result, diagnose};
}

use api::BindingType;

pub mod binding;
pub mod chain;
pub mod controllers;
pub mod executor;
pub mod hook;
pub mod manager;
pub mod metrics;
pub mod runner;
pub mod tls;
pub mod webhooks;

#[cfg(test)]
mod testing;

/// FIELD_MANAGER is the field manager name used for writes to the cluster.
pub const FIELD_MANAGER: &str = "hook-operator";

// NB The docs are unclear, but backtraces are unsupported on stable.
/// Error is the controller's error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("openssl error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    #[error("api error: {0}")]
    Api(#[from] api::Error),
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("hook {path:?} failed with exit code {code:?}: {stderr}")]
    HookExec {
        path: std::path::PathBuf,
        code: Option<i32>,
        stderr: String,
    },
    #[error("hook {hook:?} has a bad config: {source}")]
    HookConfig {
        hook: String,
        #[source]
        source: api::Error,
    },
    #[error("hook {0:?} is bound to onStartup but has no order")]
    StartupOrder(String),
    #[error("reconcile of {name:?} failed: {source}")]
    Reconcile {
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("hook {hook:?} returned no {kind} response")]
    NoResponse { hook: String, kind: &'static str },
    #[error("no hook handles {0}")]
    Unhandled(String),
    #[error("conversion of {crd:?} failed: {message}")]
    Conversion { crd: String, message: String },
}

/// Result typedef for the controller.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Diagnostic is a condition that indicates a bug in the operator or in a hook's configuration.
///
/// Diagnostics are reported and then processing continues as if nothing happened.
#[derive(Clone, Debug, PartialEq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Diagnostic {
    /// A hook declared webhooks under more than one configuration id.
    InconsistentConfigurationId {
        hook: String,
        binding_type: BindingType,
        kept: String,
        seen: String,
    },
    /// An event arrived for a configuration id the controller does not use.
    UnknownConfiguration {
        binding_type: BindingType,
        configuration_id: String,
        webhook_id: String,
    },
    /// An event arrived for a webhook id the controller does not know.
    UnknownWebhook {
        binding_type: BindingType,
        configuration_id: String,
        webhook_id: String,
    },
    /// A kube event arrived for a monitor the controller does not know.
    UnknownMonitor { monitor_id: String },
}

/// Diagnose reports `d` on the "bug" channel.
pub fn diagnose(d: Diagnostic) {
    let kind: &'static str = (&d).into();
    ::metrics::counter!(crate::metrics::BUG_SIGNALS, "kind" => kind).increment(1);
    match &d {
        Diagnostic::InconsistentConfigurationId {
            hook,
            binding_type,
            kept,
            seen,
        } => tracing::error!(
            target: "bug",
            kind,
            hook = %hook,
            %binding_type,
            kept = %kept,
            seen = %seen,
            "possible bug: webhooks have non-unique configurationIds"
        ),
        Diagnostic::UnknownConfiguration {
            binding_type,
            configuration_id,
            webhook_id,
        } => tracing::error!(
            target: "bug",
            kind,
            %binding_type,
            configuration_id = %configuration_id,
            webhook_id = %webhook_id,
            "possible bug: no binding for configurationId"
        ),
        Diagnostic::UnknownWebhook {
            binding_type,
            configuration_id,
            webhook_id,
        } => tracing::error!(
            target: "bug",
            kind,
            %binding_type,
            configuration_id = %configuration_id,
            webhook_id = %webhook_id,
            "possible bug: no binding for webhookId"
        ),
        Diagnostic::UnknownMonitor { monitor_id } => tracing::error!(
            target: "bug",
            kind,
            monitor_id = %monitor_id,
            "possible bug: no binding for monitor"
        ),
    }
}
