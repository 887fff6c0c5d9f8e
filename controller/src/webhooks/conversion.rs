use std::collections::BTreeSet;

use k8s_openapi::{
    ByteString,
    apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceConversion, CustomResourceDefinition, ServiceReference, WebhookClientConfig,
        WebhookConversion,
    },
};
use kube::Client;
use serde_json::json;

use super::WebhookSettings;
use crate::{FIELD_MANAGER, prelude::*};

/// ConversionWebhookManager points CRDs at the conversion webhook server.
///
/// The CRDs themselves are owned by someone else; only `spec.conversion` is patched.
#[derive(Clone, Debug, Default)]
pub struct ConversionWebhookManager {
    settings: WebhookSettings,
    crds: BTreeSet<String>,
}

impl ConversionWebhookManager {
    /// New returns a manager with no CRDs.
    pub fn new(settings: WebhookSettings) -> Self {
        Self {
            settings,
            crds: BTreeSet::new(),
        }
    }

    /// Settings returns how the cluster reaches the webhook server.
    pub fn settings(&self) -> &WebhookSettings {
        &self.settings
    }

    /// Add_crd registers `crd_name` for conversion. Adding a CRD twice has no effect.
    pub fn add_crd<S: Into<String>>(&mut self, crd_name: S) {
        self.crds.insert(crd_name.into());
    }

    /// Crds lists the registered CRD names.
    pub fn crds(&self) -> impl Iterator<Item = &str> {
        self.crds.iter().map(String::as_str)
    }

    /// Conversion builds the `spec.conversion` stanza for `crd_name`.
    pub fn conversion(&self, crd_name: &str) -> CustomResourceConversion {
        CustomResourceConversion {
            strategy: "Webhook".into(),
            webhook: Some(WebhookConversion {
                client_config: Some(WebhookClientConfig {
                    ca_bundle: (!self.settings.ca_bundle.is_empty())
                        .then(|| ByteString(self.settings.ca_bundle.clone())),
                    service: Some(ServiceReference {
                        name: self.settings.service_name.clone(),
                        namespace: self.settings.namespace.clone(),
                        path: Some(format!("/{crd_name}")),
                        port: None,
                    }),
                    url: None,
                }),
                conversion_review_versions: vec!["v1".into()],
            }),
        }
    }

    /// Create_configuration patches every registered CRD.
    #[instrument(skip_all)]
    pub async fn create_configuration(&self, client: Client) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(client);
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        for name in &self.crds {
            let patch = json!({ "spec": { "conversion": self.conversion(name) } });
            api.patch(name, &pp, &Patch::Merge(&patch))
                .await
                .map_err(|source| Error::Reconcile {
                    name: name.clone(),
                    source,
                })?;
            info!(crd = %name, "conversion webhook configured");
        }
        Ok(())
    }
}
