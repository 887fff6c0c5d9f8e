#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the types exchanged between hooks, the operator, and the webhook servers.
//!
//! The [`v1`] module is the configuration document a hook prints when run with `--config`.
//! The [`events`] module holds the events routed to hooks, and [`response`] holds the decision
//! documents hooks write back.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod events;
pub mod response;
pub mod v1;

pub use events::*;
pub use response::*;
pub use v1::{ConversionRule, HookConfig};

/// DEFAULT_CONFIGURATION_ID is used for webhooks that do not name a configuration.
pub const DEFAULT_CONFIGURATION_ID: &str = "hooks";

/// BindingType enumerates the kinds of triggers a hook can bind to.
///
/// The string forms match the keys of the configuration document.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum BindingType {
    /// Run once at startup, ordered by the declared number.
    OnStartup,
    /// Run on a crontab schedule.
    Schedule,
    /// Run on Kubernetes object changes.
    #[serde(rename = "kubernetes")]
    #[strum(serialize = "kubernetes")]
    OnKubernetesEvent,
    /// Run for validating admission reviews.
    KubernetesValidating,
    /// Run for mutating admission reviews.
    KubernetesMutating,
    /// Run for CRD version conversion reviews.
    #[serde(rename = "kubernetesCustomResourceConversion")]
    #[strum(serialize = "kubernetesCustomResourceConversion")]
    KubernetesConversion,
}

/// Error is the error type for loading api documents.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Reading a document failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A JSON document was malformed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// A YAML document was malformed.
    #[error("yaml error: {0}")]
    YAML(#[from] serde_yaml::Error),
    /// The configuration document declared a version this crate does not understand.
    #[error("unsupported configVersion {0:?}, only \"v1\" is supported")]
    ConfigVersion(String),
    /// The configuration document failed validation.
    #[error("invalid config: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Result typedef for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn binding_type_names() {
        assert_eq!(BindingType::OnKubernetesEvent.to_string(), "kubernetes");
        assert_eq!(
            BindingType::KubernetesConversion.to_string(),
            "kubernetesCustomResourceConversion"
        );
        assert_eq!(BindingType::OnStartup.to_string(), "onStartup");
        assert_eq!(
            BindingType::from_str("kubernetesMutating").unwrap(),
            BindingType::KubernetesMutating
        );
        let v: BindingType = serde_json::from_str("\"kubernetes\"").unwrap();
        assert_eq!(v, BindingType::OnKubernetesEvent);
    }
}
