//! In-memory collaborators and object builders for unit tests.

use eyre::{Result, format_err};
use k8s_openapi::{
    ByteString,
    api::{core::v1 as core, networking::v1 as networking},
    apimachinery::pkg::apis::meta::v1 as meta,
};
use kube::runtime::events::EventType;
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::{Arc, Mutex};

use crate::{
    ObjectKey,
    class::IngressClassInfo,
    cluster::{Cluster, EventRecorder, ObjectIndex},
};

#[derive(Default)]
pub struct MemoryIndex {
    services: Set<ObjectKey>,
    ingresses: Map<ObjectKey, Arc<networking::Ingress>>,
    classes: Map<String, IngressClassInfo>,
}

impl MemoryIndex {
    pub fn with_service(mut self, namespace: &str, name: &str) -> Self {
        self.services.insert(ObjectKey::new(namespace, name));
        self
    }

    pub fn with_class(mut self, class: IngressClassInfo) -> Self {
        self.classes.insert(class.name.clone(), class);
        self
    }

    pub fn with_ingress(mut self, ing: &networking::Ingress) -> Self {
        let key = ObjectKey::try_from(&ing.metadata).unwrap();
        self.ingresses.insert(key, Arc::new(ing.clone()));
        self
    }
}

impl ObjectIndex for MemoryIndex {
    fn service(&self, namespace: &str, name: &str) -> Option<Arc<core::Service>> {
        let key = ObjectKey::new(namespace, name);
        self.services.contains(&key).then(|| {
            Arc::new(core::Service {
                metadata: meta::ObjectMeta {
                    namespace: Some(key.namespace),
                    name: Some(key.name),
                    ..Default::default()
                },
                ..Default::default()
            })
        })
    }

    fn ingress(&self, namespace: &str, name: &str) -> Option<Arc<networking::Ingress>> {
        self.ingresses.get(&ObjectKey::new(namespace, name)).cloned()
    }

    fn ingress_class(&self, name: &str) -> Option<IngressClassInfo> {
        self.classes.get(name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub ingress: String,
    pub warning: bool,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct MemoryEvents(Mutex<Vec<RecordedEvent>>);

impl MemoryEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|e| e.reason.clone()).collect()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl EventRecorder for MemoryEvents {
    fn record(&self, ing: &networking::Ingress, type_: EventType, reason: &str, message: String) {
        self.0.lock().unwrap().push(RecordedEvent {
            ingress: ObjectKey::try_from(&ing.metadata).unwrap().to_string(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            message,
        });
    }
}

#[derive(Default)]
pub struct MemoryCluster {
    pub secrets: Mutex<Map<ObjectKey, core::Secret>>,
    /// (ingress, ip)
    pub status_updates: Mutex<Vec<(String, String)>>,
    /// (ingress, key, value)
    pub annotations: Mutex<Vec<(String, String, String)>>,
    /// error returned by every status update
    pub status_error: Mutex<Option<String>>,
}

impl MemoryCluster {
    pub fn with_secret(self, secret: core::Secret) -> Self {
        let key = ObjectKey::try_from(&secret.metadata).unwrap();
        self.secrets.lock().unwrap().insert(key, secret);
        self
    }

    pub fn status_updates(&self) -> Vec<(String, String)> {
        self.status_updates.lock().unwrap().clone()
    }
}

impl Cluster for MemoryCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<core::Secret>> {
        let secrets = self.secrets.lock().unwrap();
        Ok(secrets.get(&ObjectKey::new(namespace, name)).cloned())
    }

    async fn update_ingress_status(&self, ing: &networking::Ingress, ip: &str) -> Result<()> {
        if let Some(e) = self.status_error.lock().unwrap().clone() {
            return Err(format_err!("{e}"));
        }
        let key = ObjectKey::try_from(&ing.metadata).unwrap().to_string();
        self.status_updates.lock().unwrap().push((key, ip.to_string()));
        Ok(())
    }

    async fn annotate_ingress(&self, ing: &networking::Ingress, key: &str, value: &str) -> Result<()> {
        let ing_key = ObjectKey::try_from(&ing.metadata).unwrap().to_string();
        (self.annotations.lock().unwrap()).push((ing_key, key.to_string(), value.to_string()));
        Ok(())
    }
}

fn metadata(namespace: &str, name: &str) -> meta::ObjectMeta {
    meta::ObjectMeta {
        namespace: Some(namespace.into()),
        name: Some(name.into()),
        resource_version: Some("1".into()),
        ..Default::default()
    }
}

pub fn backend(service: &str, port: i32) -> networking::IngressBackend {
    networking::IngressBackend {
        service: Some(networking::IngressServiceBackend {
            name: service.into(),
            port: Some(networking::ServiceBackendPort {
                number: Some(port),
                name: None,
            }),
        }),
        resource: None,
    }
}

pub fn single_service(namespace: &str, name: &str, service: &str, port: i32) -> networking::Ingress {
    networking::Ingress {
        metadata: metadata(namespace, name),
        spec: Some(networking::IngressSpec {
            default_backend: Some(backend(service, port)),
            ..Default::default()
        }),
        status: None,
    }
}

/// Rules from `(host, path, service, port)` entries, grouped by host in order of appearance.
pub fn multi_service(
    namespace: &str,
    name: &str,
    paths: &[(&str, &str, &str, i32)],
) -> networking::Ingress {
    let mut rules: Vec<networking::IngressRule> = Vec::new();
    for &(host, path, service, port) in paths {
        let host = (!host.is_empty()).then(|| host.to_string());
        let idx = match rules.iter().position(|r| r.host == host) {
            Some(idx) => idx,
            None => {
                rules.push(networking::IngressRule {
                    host: host.clone(),
                    http: Some(networking::HTTPIngressRuleValue { paths: vec![] }),
                });
                rules.len() - 1
            }
        };
        (rules[idx].http.as_mut().unwrap()).paths.push(networking::HTTPIngressPath {
            backend: backend(service, port),
            path: Some(path.to_string()),
            path_type: "Prefix".into(),
        });
    }

    networking::Ingress {
        metadata: metadata(namespace, name),
        spec: Some(networking::IngressSpec {
            rules: Some(rules),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn annotate(ing: &mut networking::Ingress, key: &str, value: &str) {
    (ing.metadata.annotations.get_or_insert_default()).insert(key.to_string(), value.to_string());
}

pub fn with_tls(ing: &mut networking::Ingress, secret: &str, hosts: &[&str]) {
    let spec = ing.spec.get_or_insert_default();
    spec.tls.get_or_insert_default().push(networking::IngressTLS {
        hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
        secret_name: Some(secret.to_string()),
    });
}

/// A `kubernetes.io/tls` secret holding a freshly generated self-signed certificate.
pub fn tls_secret(namespace: &str, name: &str) -> core::Secret {
    use openssl::{
        asn1::Asn1Time, hash::MessageDigest, pkey::PKey, rsa::Rsa, x509::X509, x509::X509Name,
    };

    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut subject = X509Name::builder().unwrap();
    subject.append_entry_by_text("CN", "test.example.com").unwrap();
    let subject = subject.build();

    let mut cert = X509::builder().unwrap();
    cert.set_version(2).unwrap();
    cert.set_subject_name(&subject).unwrap();
    cert.set_issuer_name(&subject).unwrap();
    cert.set_pubkey(&key).unwrap();
    cert.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    cert.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    cert.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = cert.build();

    core::Secret {
        metadata: metadata(namespace, name),
        type_: Some("kubernetes.io/tls".into()),
        data: Some(Map::from([
            ("tls.crt".to_string(), ByteString(cert.to_pem().unwrap())),
            (
                "tls.key".to_string(),
                ByteString(key.private_key_to_pem_pkcs8().unwrap()),
            ),
        ])),
        ..Default::default()
    }
}
