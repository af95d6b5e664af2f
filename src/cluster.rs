//! What the reconciler needs from the cluster: indexed lookups, writes and events.

use eyre::Result;
use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use kube::{
    Client, Resource,
    api::{Api, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use log::warn;
use std::collections::BTreeMap as Map;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::{ObjectKey, class::IngressClassInfo};

/// Event reasons recorded on Ingresses.
pub mod reasons {
    pub const INVALID_DATA: &str = "InvalidData";
    pub const RULE_ERROR: &str = "RuleError";
    pub const SECRET_NOT_FOUND: &str = "SecretNotFound";
    pub const STATUS_IP_ERROR: &str = "StatusIPError";
    pub const DNS_RESOLUTION_ERROR: &str = "DNSResolutionError";
    pub const IP_ANNOTATION_ERROR: &str = "IPAnnotationError";
    pub const HOST_RESOLVED: &str = "HostResolvedSuccessfully";
    pub const MONITOR_RULE_NOT_FOUND: &str = "MonitorRuleNotFound";
    pub const MONITOR_RULE_NOT_USED: &str = "MonitorRuleNotUsed";
    pub const DUPLICATE_PATH: &str = "DuplicatePath";
}

/// Indexed lookups in the informer caches.
pub trait ObjectIndex: Send + Sync {
    fn service(&self, namespace: &str, name: &str) -> Option<Arc<core::Service>>;
    fn ingress(&self, namespace: &str, name: &str) -> Option<Arc<networking::Ingress>>;
    fn ingress_class(&self, name: &str) -> Option<IngressClassInfo>;
}

/// Objects received from the cluster watches, by key. Cluster scoped objects have an empty
/// namespace.
#[derive(Default)]
pub struct WatchedObjects {
    pub services: RwLock<Map<ObjectKey, Arc<core::Service>>>,
    pub ingresses: RwLock<Map<ObjectKey, Arc<networking::Ingress>>>,
    pub classes: RwLock<Map<ObjectKey, Arc<networking::IngressClass>>>,
}

fn get<T>(map: &RwLock<Map<ObjectKey, Arc<T>>>, key: &ObjectKey) -> Option<Arc<T>> {
    let map = map.read().unwrap_or_else(|e| e.into_inner());
    map.get(key).cloned()
}

impl ObjectIndex for WatchedObjects {
    fn service(&self, namespace: &str, name: &str) -> Option<Arc<core::Service>> {
        get(&self.services, &ObjectKey::new(namespace, name))
    }

    fn ingress(&self, namespace: &str, name: &str) -> Option<Arc<networking::Ingress>> {
        get(&self.ingresses, &ObjectKey::new(namespace, name))
    }

    fn ingress_class(&self, name: &str) -> Option<IngressClassInfo> {
        let class = get(&self.classes, &ObjectKey::new("", name))?;
        Some(IngressClassInfo::from(class.as_ref()))
    }
}

/// Records user visible events. Delivery is best effort and never fails the caller.
pub trait EventRecorder: Send + Sync {
    fn record(&self, ing: &networking::Ingress, type_: EventType, reason: &str, message: String);
}

pub struct KubeEvents {
    client: Client,
    reporter: Reporter,
}

impl KubeEvents {
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: None,
            },
        }
    }
}

impl EventRecorder for KubeEvents {
    fn record(&self, ing: &networking::Ingress, type_: EventType, reason: &str, message: String) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            ing.object_ref(&()),
        );
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: "Reconcile".into(),
            secondary: None,
        };
        tokio::spawn(async move {
            if let Err(e) = recorder.publish(event).await {
                warn!("failed to publish event: {e}");
            }
        });
    }
}

/// Cluster writes and direct reads.
pub trait Cluster: Send + Sync + 'static {
    fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<core::Secret>>> + Send;

    /// Sets the Ingress load balancer status to `ip`, guarded by the object's resource version.
    fn update_ingress_status(
        &self,
        ing: &networking::Ingress,
        ip: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn annotate_ingress(
        &self,
        ing: &networking::Ingress,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ingresses(&self, ing: &networking::Ingress) -> Api<networking::Ingress> {
        let namespace = ing.metadata.namespace.as_deref().unwrap_or("default");
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl Cluster for KubeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<core::Secret>> {
        let api = Api::<core::Secret>::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_ingress_status(&self, ing: &networking::Ingress, ip: &str) -> Result<()> {
        let name = ing.metadata.name.as_deref().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": ing.metadata.resource_version },
            "status": { "loadBalancer": { "ingress": [ { "ip": ip } ] } },
        });
        (self.ingresses(ing))
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn annotate_ingress(&self, ing: &networking::Ingress, key: &str, value: &str) -> Result<()> {
        let name = ing.metadata.name.as_deref().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: value } },
        });
        (self.ingresses(ing))
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
