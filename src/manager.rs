//! Reconciles one Ingress at a time into the shared store.
//!
//! A sync parses the annotations, checks the class, picks the bind address and then, under the
//! store lock, merges the Ingress' draft on each of its ports before applying TLS and health
//! monitors. Virtuals the Ingress no longer produces are withdrawn from. Deployment is signaled
//! through a generation counter once the lock is released.

use eyre::{Result, format_err};
use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use kube::runtime::events::EventType;
use log::{debug, info, warn};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

use crate::{
    ControllerConfig, ObjectKey, annotations,
    annotations::IngressAnnotations,
    class,
    cluster::{Cluster, EventRecorder, ObjectIndex, reasons},
    health::{self, HostToPathMap, MonitorContext},
    merge, ports,
    ports::TlsState,
    resolvers::HostResolver,
    split_route_domain,
    store::{ResourceStore, Resources},
    synth,
    tls::{self, ServiceFwdRuleMap, TlsContext},
};

const STATUS_CONFLICT: &str = "object has been modified";

pub struct Manager<C> {
    config: ControllerConfig,
    store: ResourceStore,
    index: Arc<dyn ObjectIndex>,
    events: Arc<dyn EventRecorder>,
    cluster: Arc<C>,
    /// secret => last fetched copy, `None` when it does not exist
    ssl_context: Mutex<Map<ObjectKey, Option<core::Secret>>>,
    deploy: watch::Sender<u64>,
}

impl<C: Cluster> Manager<C> {
    /// The receiver's value is bumped every time the store changes.
    pub fn new(
        config: ControllerConfig,
        store: ResourceStore,
        index: Arc<dyn ObjectIndex>,
        events: Arc<dyn EventRecorder>,
        cluster: Arc<C>,
    ) -> (Self, watch::Receiver<u64>) {
        let (deploy, deploy_rx) = watch::channel(0);
        let manager = Self {
            config,
            store,
            index,
            events,
            cluster,
            ssl_context: Mutex::new(Map::new()),
            deploy,
        };
        (manager, deploy_rx)
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    fn signal_deploy(&self) {
        self.deploy.send_modify(|generation| *generation += 1);
    }

    fn warn_event(&self, ing: &networking::Ingress, reason: &str, message: String) {
        self.events.record(ing, EventType::Warning, reason, message);
    }

    /// Syncs `ing` into the store. Returns whether at least one of its virtuals accepted it.
    pub async fn sync_ingress(&self, ing: &networking::Ingress) -> Result<bool> {
        let key = ObjectKey::try_from(&ing.metadata).map_err(|e| format_err!("invalid Ingress: {e}"))?;
        let ann = IngressAnnotations::parse(crate::annotations(ing));
        for error in &ann.errors {
            warn!("{key}: {error}");
            self.warn_event(ing, reasons::INVALID_DATA, error.to_string());
        }

        let index = self.index.as_ref();
        if !class::is_managed(ing, ann.class.as_deref(), &self.config, index) {
            debug!("{key}: not handled by this controller");
            self.remove_ingress(&key).await;
            return Ok(false);
        }

        let bind_addr = match (self.config.resolve_ingress.as_ref(), ann.bind_addr.as_ref()) {
            (Some(resolver), None) => match self.resolve_host(resolver, ing, &key).await {
                Some(addr) => addr,
                None => return Ok(false),
            },
            _ => synth::bind_address(&ann, &self.config),
        };

        let has_tls = ports::has_tls(ing, &ann);
        let secrets = match ann.client_ssl {
            Some(_) => Map::new(),
            None => self.refresh_secrets(ing, &key).await,
        };
        let tls_ctx = TlsContext {
            ing,
            key: &key,
            ann: &ann,
            state: TlsState::of(has_tls, &ann),
            secrets: &secrets,
            events: self.events.as_ref(),
        };
        let monitor_ctx = MonitorContext {
            ing,
            key: &key,
            events: self.events.as_ref(),
        };

        let mut resources = self.store.lock().await;
        let shared_before = resources.shared.clone();
        let mut changed = false;
        let mut keep = Set::new();
        let mut fwd = ServiceFwdRuleMap::default();

        for port in ports::virtual_ports(&ann, has_tls) {
            let draft = synth::synthesize(ing, &key, &ann, port.port, &bind_addr, &self.config, index);
            let draft = match draft {
                Ok(Some(draft)) => draft,
                Ok(None) => continue,
                Err(e) => {
                    warn!("{key}: {port}: {e}");
                    self.warn_event(ing, reasons::RULE_ERROR, e.to_string());
                    continue;
                }
            };

            let virtual_name = draft.virtual_name.clone();
            let before = resources.get(&virtual_name).cloned();
            let single_pool = (draft.single_service)
                .then(|| draft.pools.first().map(|p| p.full_name()))
                .flatten();
            let single_service = draft.single_service;

            let Some(name) = merge::merge(&mut resources, draft, &self.config.snat_pool_name) else {
                debug!("{key}: {port}: not handled");
                changed |= before.is_some() && resources.get(&virtual_name).is_none();
                continue;
            };
            keep.insert(name.clone());

            let Resources { configs, shared } = &mut *resources;
            let Some(cfg) = configs.get_mut(&name) else {
                continue;
            };

            tls::apply(cfg, shared, &tls_ctx, port, &mut fwd);

            let mut map = HostToPathMap::new();
            if !ann.health_monitors.is_empty() {
                map = if single_service {
                    health::single_service_paths(ing)
                } else {
                    health::multi_service_paths(&monitor_ctx)
                };
                health::assign_monitors(&mut map, &ann.health_monitors, &monitor_ctx);
                match single_pool.as_deref() {
                    Some(pool) => health::bind_single_service(cfg, pool, &mut map),
                    None => health::bind_multi_service(cfg, &mut map),
                };
                health::notify_unused(&map, &monitor_ctx);
            }
            health::record_bindings(cfg, &key, &map);

            changed |= before.as_ref() != Some(&*cfg);
        }

        changed |= tls::apply_fwd_rules(&mut resources.shared, &fwd);
        changed |= merge::withdraw(&mut resources, &key, &keep);
        changed |= resources.shared != shared_before;
        drop(resources);

        if changed {
            info!("{key}: synced on {}", itertools::join(&keep, ", "));
            self.signal_deploy();
        }

        let handled = !keep.is_empty();
        if handled {
            self.update_status(ing, &key, &bind_addr);
        }
        Ok(handled)
    }

    /// Withdraws everything `key` contributed. Returns whether the store changed.
    pub async fn remove_ingress(&self, key: &ObjectKey) -> bool {
        let changed = merge::remove_ingress(&mut *self.store.lock().await, key);
        if changed {
            info!("{key}: removed");
            self.signal_deploy();
        }
        changed
    }

    /// Resolves the first rule's host and persists the address as the bind address annotation.
    async fn resolve_host(
        &self,
        resolver: &HostResolver,
        ing: &networking::Ingress,
        key: &ObjectKey,
    ) -> Option<String> {
        let dns_error = |msg: String| {
            warn!("{key}: {msg}");
            self.warn_event(ing, reasons::DNS_RESOLUTION_ERROR, msg);
        };

        let rules = (ing.spec.as_ref()).and_then(|s| s.rules.as_ref());
        let Some(rule) = rules.and_then(|rules| rules.first()) else {
            dns_error(format!("no host found for DNS resolution on Ingress {key}"));
            return None;
        };
        let host = rule.host.as_deref().unwrap_or_default();
        if host.is_empty() {
            dns_error(format!("first host is empty on Ingress {key}, cannot resolve"));
            return None;
        }

        let ip = match resolver.resolve(host).await {
            Ok(ip) => ip.to_string(),
            Err(e) => {
                dns_error(format!("error while resolving host {host}: {e}"));
                return None;
            }
        };

        match (self.cluster).annotate_ingress(ing, annotations::BIND_ADDR, &ip).await {
            Ok(()) => {
                let msg = format!(
                    "resolved host {host} as {ip}, set {} annotation with address",
                    annotations::BIND_ADDR
                );
                info!("{key}: {msg}");
                self.events.record(ing, EventType::Normal, reasons::HOST_RESOLVED, msg);
            }
            Err(e) => {
                let msg = format!("error while setting virtual-server IP for Ingress {key}: {e}");
                warn!("{msg}");
                self.warn_event(ing, reasons::IP_ANNOTATION_ERROR, msg);
            }
        }
        Some(ip)
    }

    /// Fetches the TLS secrets of `ing`. A failed fetch falls back to the last known copy.
    async fn refresh_secrets(
        &self,
        ing: &networking::Ingress,
        key: &ObjectKey,
    ) -> Map<ObjectKey, Option<core::Secret>> {
        let tls = (ing.spec.as_ref()).and_then(|s| s.tls.as_ref());
        let names: Set<&str> = (tls.into_iter().flatten())
            .filter_map(|t| t.secret_name.as_deref())
            .collect();

        let mut cache = self.ssl_context.lock().await;
        let mut secrets = Map::new();
        for name in names {
            let secret_key = ObjectKey::new(&key.namespace, name);
            let secret = match self.cluster.get_secret(&key.namespace, name).await {
                Ok(secret) => secret,
                Err(e) => {
                    warn!("{key}: failed to get secret {secret_key}: {e}");
                    cache.get(&secret_key).cloned().flatten()
                }
            };
            cache.insert(secret_key.clone(), secret.clone());
            secrets.insert(secret_key, secret);
        }
        secrets
    }

    /// Sets the Ingress status to its bind address in a detached task, if it changed.
    fn update_status(&self, ing: &networking::Ingress, key: &ObjectKey, bind_addr: &str) {
        let ip = split_route_domain(bind_addr).to_string();
        if ip.is_empty() {
            return;
        }
        let current = (ing.status.as_ref())
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first())
            .and_then(|first| first.ip.as_deref());
        if current == Some(ip.as_str()) {
            return;
        }

        let key = key.clone();
        let index = self.index.clone();
        let events = self.events.clone();
        let cluster = self.cluster.clone();

        tokio::spawn(async move {
            // only the latest cached copy is worth writing
            let Some(latest) = index.ingress(&key.namespace, &key.name) else {
                return;
            };
            let Err(e) = cluster.update_ingress_status(&latest, &ip).await else {
                debug!("{key}: status set to {ip}");
                return;
            };
            let e = e.to_string();
            if e.contains(STATUS_CONFLICT) {
                return;
            }
            let msg = format!("error when setting Ingress status IP {ip}: {e}");
            warn!("{key}: {msg}");
            events.record(&latest, EventType::Warning, reasons::STATUS_IP_ERROR, msg);
        });
    }
}
