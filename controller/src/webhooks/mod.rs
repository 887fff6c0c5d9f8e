//! Webhooks keeps the cluster's webhook configuration objects in sync with what hooks declare.
//!
//! Each configuration id gets its own [`WebhookResource`]: one admission configuration object
//! holding every webhook declared under that id. The API server calls back on the path built by
//! [`WebhookResource::create_webhook_path`], which the webhook servers decode again.
//!
//! Reconciliation is list-then-write. The update carries the `resourceVersion` read by the list,
//! so a concurrent writer makes the API server answer `409 Conflict`, and the sequence is re-run.

use std::{collections::BTreeMap, fmt::Debug};

use admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, ServiceReference, ValidatingWebhook,
    ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::{ByteString, ClusterResourceScope};
use kube::{Client, api::DeleteParams};
use serde::{Serialize, de::DeserializeOwned};

use crate::{FIELD_MANAGER, hook::WebhookConfig, prelude::*};

mod conversion;
pub use conversion::ConversionWebhookManager;

/// MAX_ATTEMPTS bounds the list-then-write sequence when the API server reports a conflict.
pub const MAX_ATTEMPTS: usize = 3;

/// ConfigurationKind is implemented by the admission configuration object types.
pub trait ConfigurationKind:
    Resource<DynamicType = (), Scope = ClusterResourceScope>
    + Clone
    + Debug
    + Default
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Webhook is the type of a single webhook entry in the object.
    type Webhook: Clone + Debug + Default + PartialEq + Send + Sync;

    /// Stamp fills in the fields every webhook in the object shares.
    fn stamp(w: &mut Self::Webhook, client_config: WebhookClientConfig);

    /// Set_webhooks replaces the object's webhook list.
    fn set_webhooks(&mut self, webhooks: Vec<Self::Webhook>);

    /// Webhooks returns the object's webhook list.
    fn webhooks(&self) -> &[Self::Webhook];
}

fn review_versions() -> Vec<String> {
    vec!["v1".into(), "v1beta1".into()]
}

impl ConfigurationKind for ValidatingWebhookConfiguration {
    type Webhook = ValidatingWebhook;

    fn stamp(w: &mut Self::Webhook, client_config: WebhookClientConfig) {
        w.match_policy = Some("Equivalent".into());
        w.admission_review_versions = review_versions();
        w.client_config = client_config;
    }

    fn set_webhooks(&mut self, webhooks: Vec<Self::Webhook>) {
        self.webhooks = Some(webhooks);
    }

    fn webhooks(&self) -> &[Self::Webhook] {
        self.webhooks.as_deref().unwrap_or_default()
    }
}

impl ConfigurationKind for MutatingWebhookConfiguration {
    type Webhook = MutatingWebhook;

    fn stamp(w: &mut Self::Webhook, client_config: WebhookClientConfig) {
        w.match_policy = Some("Equivalent".into());
        w.admission_review_versions = review_versions();
        w.client_config = client_config;
    }

    fn set_webhooks(&mut self, webhooks: Vec<Self::Webhook>) {
        self.webhooks = Some(webhooks);
    }

    fn webhooks(&self) -> &[Self::Webhook] {
        self.webhooks.as_deref().unwrap_or_default()
    }
}

/// WebhookSettings is how the cluster reaches the operator's webhook server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WebhookSettings {
    pub service_name: String,
    pub namespace: String,
    /// ConfigurationName names the object for the default configuration id.
    pub configuration_name: String,
    /// CaBundle is the PEM bundle the API server uses to verify the webhook server.
    pub ca_bundle: Vec<u8>,
}

/// WebhookResource is one configuration object and the webhooks it holds.
#[derive(Clone, Debug)]
pub struct WebhookResource<K: ConfigurationKind> {
    configuration_id: String,
    settings: WebhookSettings,
    webhooks: BTreeMap<String, WebhookConfig<K::Webhook>>,
}

impl<K: ConfigurationKind> WebhookResource<K> {
    /// New returns an empty resource for `configuration_id`.
    pub fn new<S: Into<String>>(configuration_id: S, settings: WebhookSettings) -> Self {
        let configuration_id = configuration_id.into();
        let configuration_id = if configuration_id.is_empty() {
            DEFAULT_CONFIGURATION_ID.to_string()
        } else {
            configuration_id
        };
        Self {
            configuration_id,
            settings,
            webhooks: BTreeMap::new(),
        }
    }

    /// Configuration_id reports the id this resource was created for.
    pub fn configuration_id(&self) -> &str {
        &self.configuration_id
    }

    /// Name is the name of the configuration object.
    pub fn name(&self) -> String {
        if self.configuration_id == DEFAULT_CONFIGURATION_ID {
            self.settings.configuration_name.clone()
        } else {
            format!(
                "{}-{}",
                self.settings.configuration_name, self.configuration_id
            )
        }
    }

    /// Add_webhook indexes `w` by its webhook id. A later webhook with the same id replaces an
    /// earlier one.
    pub fn add_webhook(&mut self, w: &WebhookConfig<K::Webhook>) {
        self.webhooks
            .insert(w.metadata.webhook_id.clone(), w.clone());
    }

    /// Webhook_ids lists the ids of the held webhooks, in order.
    pub fn webhook_ids(&self) -> impl Iterator<Item = &str> {
        self.webhooks.keys().map(String::as_str)
    }

    /// Create_webhook_path returns the path the API server calls for `w`.
    pub fn create_webhook_path(w: &WebhookConfig<K::Webhook>) -> String {
        let id = w.metadata.configuration_id.as_str();
        let id = if id.is_empty() {
            DEFAULT_CONFIGURATION_ID
        } else {
            id
        };
        format!("/{id}/{}", w.metadata.webhook_id)
    }

    /// Webhooks returns the stamped webhook list.
    pub fn webhooks(&self) -> Vec<K::Webhook> {
        let ca_bundle = (!self.settings.ca_bundle.is_empty())
            .then(|| ByteString(self.settings.ca_bundle.clone()));
        self.webhooks
            .values()
            .map(|w| {
                let mut out = w.webhook.clone();
                K::stamp(
                    &mut out,
                    WebhookClientConfig {
                        ca_bundle: ca_bundle.clone(),
                        service: Some(ServiceReference {
                            name: self.settings.service_name.clone(),
                            namespace: self.settings.namespace.clone(),
                            path: Some(Self::create_webhook_path(w)),
                            port: None,
                        }),
                        url: None,
                    },
                );
                out
            })
            .collect()
    }

    /// Desired builds the configuration object this resource should have in the cluster.
    pub fn desired(&self) -> K {
        let mut obj = K::default();
        let meta = obj.meta_mut();
        meta.name = Some(self.name());
        meta.labels = Some(BTreeMap::from([(
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        )]));
        obj.set_webhooks(self.webhooks());
        obj
    }

    /// Create_configuration writes the desired object to the cluster.
    pub async fn create_configuration(&self, client: Client) -> Result<()> {
        self.create_or_update(client, self.desired()).await
    }

    /// Create_or_update creates `desired` or replaces the webhooks of the existing object.
    #[instrument(skip_all, fields(name = %self.name(), kind = %K::kind(&())))]
    pub async fn create_or_update(&self, client: Client, desired: K) -> Result<()> {
        let api: Api<K> = Api::all(client);
        let name = self.name();
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        let lp = ListParams::default().fields(&format!("metadata.name={name}"));
        let reconcile = |source| Error::Reconcile {
            name: name.clone(),
            source,
        };

        let mut last = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let list = api.list(&lp).await.map_err(reconcile)?;
            let res = match list.items.into_iter().next() {
                None => {
                    debug!(attempt, "creating configuration");
                    api.create(&pp, &desired).await
                }
                Some(mut existing) => {
                    debug!(
                        attempt,
                        resource_version = ?existing.resource_version(),
                        "updating configuration"
                    );
                    existing.set_webhooks(desired.webhooks().to_vec());
                    api.replace(&name, &pp, &existing).await
                }
            };
            match res {
                Ok(_) => {
                    info!(webhooks = desired.webhooks().len(), "configuration in sync");
                    return Ok(());
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    warn!(attempt, reason = %ae.message, "conflict writing configuration");
                    last = Some(kube::Error::Api(ae));
                }
                Err(err) => {
                    error!(error = %err, "unable to write configuration");
                    return Err(reconcile(err));
                }
            }
        }
        // Only reachable after a conflict on every attempt.
        match last {
            Some(err) => {
                error!(attempts = MAX_ATTEMPTS, "giving up after repeated conflicts");
                Err(reconcile(err))
            }
            None => Ok(()),
        }
    }

    /// Delete_configuration removes the configuration object. A missing object is not an error.
    #[instrument(skip_all, fields(name = %self.name()))]
    pub async fn delete_configuration(&self, client: Client) -> Result<()> {
        let api: Api<K> = Api::all(client);
        let name = self.name();
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("configuration deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("configuration already gone");
                Ok(())
            }
            Err(source) => Err(Error::Reconcile { name, source }),
        }
    }
}

/// WebhookManager owns one [`WebhookResource`] per configuration id.
#[derive(Clone, Debug)]
pub struct WebhookManager<K: ConfigurationKind> {
    settings: WebhookSettings,
    resources: BTreeMap<String, WebhookResource<K>>,
}

/// ValidatingWebhookManager manages `ValidatingWebhookConfiguration` objects.
pub type ValidatingWebhookManager = WebhookManager<ValidatingWebhookConfiguration>;
/// MutatingWebhookManager manages `MutatingWebhookConfiguration` objects.
pub type MutatingWebhookManager = WebhookManager<MutatingWebhookConfiguration>;

impl<K: ConfigurationKind> WebhookManager<K> {
    /// New returns a manager with no webhooks.
    pub fn new(settings: WebhookSettings) -> Self {
        Self {
            settings,
            resources: BTreeMap::new(),
        }
    }

    /// Add_webhook registers `w` under the resource for its own configuration id.
    pub fn add_webhook(&mut self, w: &WebhookConfig<K::Webhook>) {
        let id = w.metadata.configuration_id.clone();
        let settings = &self.settings;
        self.resources
            .entry(id.clone())
            .or_insert_with(|| WebhookResource::new(id, settings.clone()))
            .add_webhook(w);
    }

    /// Settings returns how the cluster reaches the webhook server.
    pub fn settings(&self) -> &WebhookSettings {
        &self.settings
    }

    /// Resources returns the managed resources keyed by configuration id.
    pub fn resources(&self) -> &BTreeMap<String, WebhookResource<K>> {
        &self.resources
    }

    /// Create_configurations reconciles every managed resource.
    pub async fn create_configurations(&self, client: Client) -> Result<()> {
        for r in self.resources.values() {
            r.create_configuration(client.clone()).await?;
        }
        Ok(())
    }

    /// Delete_configurations removes every managed configuration object.
    pub async fn delete_configurations(&self, client: Client) -> Result<()> {
        for r in self.resources.values() {
            r.delete_configuration(client.clone()).await?;
        }
        Ok(())
    }
}

/// WebhookManagers bundles the managers binding controllers register webhooks with.
#[derive(Clone, Debug)]
pub struct WebhookManagers {
    pub validating: ValidatingWebhookManager,
    pub mutating: MutatingWebhookManager,
    pub conversion: ConversionWebhookManager,
}

impl WebhookManagers {
    /// New builds empty managers. Conversion uses `conversion`'s service and bundle.
    pub fn new(
        validating: WebhookSettings,
        mutating: WebhookSettings,
        conversion: WebhookSettings,
    ) -> Self {
        Self {
            validating: WebhookManager::new(validating),
            mutating: WebhookManager::new(mutating),
            conversion: ConversionWebhookManager::new(conversion),
        }
    }

    /// Cleared returns managers with the same settings and nothing registered.
    pub fn cleared(&self) -> Self {
        Self::new(
            self.validating.settings().clone(),
            self.mutating.settings().clone(),
            self.conversion.settings().clone(),
        )
    }

    /// Create_configurations reconciles every kind that has webhooks.
    pub async fn create_configurations(&self, client: Client) -> Result<()> {
        self.validating.create_configurations(client.clone()).await?;
        self.mutating.create_configurations(client.clone()).await?;
        self.conversion.create_configuration(client).await
    }

    /// Delete_configurations removes the admission configuration objects.
    ///
    /// CRD conversion settings are left in place.
    pub async fn delete_configurations(&self, client: Client) -> Result<()> {
        self.validating.delete_configurations(client.clone()).await?;
        self.mutating.delete_configurations(client).await
    }
}

impl Default for WebhookManagers {
    fn default() -> Self {
        Self::new(
            WebhookSettings::default(),
            WebhookSettings::default(),
            WebhookSettings::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hook::WebhookMetadata,
        testing::{ApiServerVerifier, Step, test, timeout_after_1s},
    };

    fn settings() -> WebhookSettings {
        WebhookSettings {
            service_name: "hook-operator".into(),
            namespace: "hooks".into(),
            configuration_name: "hook-operator-hooks".into(),
            ca_bundle: b"-----BEGIN CERTIFICATE-----".to_vec(),
        }
    }

    fn webhook(conf: &str, id: &str) -> WebhookConfig<ValidatingWebhook> {
        WebhookConfig {
            webhook: ValidatingWebhook {
                name: format!("{id}.example.com"),
                side_effects: "None".into(),
                ..Default::default()
            },
            metadata: WebhookMetadata {
                name: id.into(),
                webhook_id: id.into(),
                configuration_id: conf.into(),
            },
        }
    }

    #[test]
    fn naming_and_paths() {
        let mut m = ValidatingWebhookManager::new(settings());
        m.add_webhook(&webhook(DEFAULT_CONFIGURATION_ID, "a"));
        m.add_webhook(&webhook(DEFAULT_CONFIGURATION_ID, "group/b"));
        m.add_webhook(&webhook("extra", "c"));

        let names: Vec<_> = m.resources().values().map(WebhookResource::name).collect();
        assert_eq!(names, vec!["hook-operator-hooks-extra", "hook-operator-hooks"]);

        let r = &m.resources()[DEFAULT_CONFIGURATION_ID];
        assert_eq!(r.webhook_ids().collect::<Vec<_>>(), vec!["a", "group/b"]);
        let obj = r.desired();
        assert_eq!(obj.metadata.name.as_deref(), Some("hook-operator-hooks"));
        let ws = obj.webhooks.expect("webhooks set");
        assert_eq!(ws.len(), 2);
        let svc = ws[1].client_config.service.as_ref().expect("service set");
        assert_eq!(svc.path.as_deref(), Some("/hooks/group/b"));
        assert_eq!(svc.namespace, "hooks");
        assert_eq!(ws[1].match_policy.as_deref(), Some("Equivalent"));
        assert_eq!(ws[1].admission_review_versions, vec!["v1", "v1beta1"]);
        assert!(ws[1].client_config.ca_bundle.is_some());
    }

    #[test]
    fn path_round_trip() {
        for (conf, id) in [("hooks", "a"), ("cfgA", "group/hook-b"), ("", "x")] {
            let path = WebhookResource::<ValidatingWebhookConfiguration>::create_webhook_path(
                &webhook(conf, id),
            );
            let (c, w) = ::webhook::detect_configuration_and_webhook(&path);
            let want = if conf.is_empty() {
                DEFAULT_CONFIGURATION_ID
            } else {
                conf
            };
            assert_eq!((c.as_str(), w.as_str()), (want, id));
        }
    }

    #[test(tokio::test)]
    async fn create_when_missing() {
        let (client, verifier) = ApiServerVerifier::new();
        let mut r = WebhookResource::<ValidatingWebhookConfiguration>::new("", settings());
        r.add_webhook(&webhook(DEFAULT_CONFIGURATION_ID, "a"));
        let server = verifier.run(vec![Step::List(None), Step::Create]);
        r.create_configuration(client).await.expect("reconciled");
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn update_existing() {
        let (client, verifier) = ApiServerVerifier::new();
        let mut r = WebhookResource::<ValidatingWebhookConfiguration>::new("", settings());
        r.add_webhook(&webhook(DEFAULT_CONFIGURATION_ID, "a"));
        let mut existing = r.desired();
        existing.metadata.resource_version = Some("42".into());
        existing.webhooks = Some(vec![]);
        let server = verifier.run(vec![
            Step::List(Some(serde_json::to_value(&existing).expect("serializes"))),
            Step::Replace {
                resource_version: "42".into(),
                webhooks: 1,
            },
        ]);
        r.create_configuration(client).await.expect("reconciled");
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn conflict_retries() {
        let (client, verifier) = ApiServerVerifier::new();
        let mut r = WebhookResource::<ValidatingWebhookConfiguration>::new("", settings());
        r.add_webhook(&webhook(DEFAULT_CONFIGURATION_ID, "a"));
        let server = verifier.run(vec![
            Step::List(None),
            Step::Conflict,
            Step::List(None),
            Step::Create,
        ]);
        r.create_configuration(client).await.expect("reconciled");
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn conflict_gives_up() {
        let (client, verifier) = ApiServerVerifier::new();
        let mut r = WebhookResource::<ValidatingWebhookConfiguration>::new("", settings());
        r.add_webhook(&webhook(DEFAULT_CONFIGURATION_ID, "a"));
        let server = verifier.run(
            std::iter::repeat_n([Step::List(None), Step::Conflict], MAX_ATTEMPTS)
                .flatten()
                .collect(),
        );
        let err = r.create_configuration(client).await.expect_err("conflicts");
        assert!(matches!(err, Error::Reconcile { .. }), "{err}");
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn delete_admission_configurations() {
        let (client, verifier) = ApiServerVerifier::new();
        let mut ms = WebhookManagers::new(settings(), settings(), WebhookSettings::default());
        ms.validating.add_webhook(&webhook("extra", "a"));
        ms.conversion.add_crd("crontabs.stable.example.com");
        let mut mutating = WebhookConfig::<MutatingWebhook>::default();
        mutating.metadata.webhook_id = "b".into();
        mutating.metadata.configuration_id = DEFAULT_CONFIGURATION_ID.into();
        ms.mutating.add_webhook(&mutating);
        let server = verifier.run(vec![
            Step::Delete("validatingwebhookconfigurations/hook-operator-hooks-extra".into()),
            Step::Delete("mutatingwebhookconfigurations/hook-operator-hooks".into()),
        ]);
        ms.delete_configurations(client).await.expect("deleted");
        timeout_after_1s(server).await;
    }

    #[test(tokio::test)]
    async fn delete() {
        let (client, verifier) = ApiServerVerifier::new();
        let r = WebhookResource::<ValidatingWebhookConfiguration>::new("extra", settings());
        let server = verifier.run(vec![Step::Delete("hook-operator-hooks-extra".into())]);
        r.delete_configuration(client).await.expect("deleted");
        timeout_after_1s(server).await;
    }
}
