use clap::Parser;
use futures::{StreamExt, TryStreamExt};
use itertools::Itertools;
use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use kube::{Client, api::Api, runtime::watcher};
use log::{debug, error, info, log_enabled, trace};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::io::Write;
use std::sync::{Arc, RwLock};
use tokio::time::Duration;

use vsingress::{
    ControllerConfig, Manager, ObjectKey, ResourceStore,
    cluster::{KubeCluster, KubeEvents, WatchedObjects},
    resolvers::HostResolver,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short = 'n', long)]
    namespace: Option<String>,
    /// class of the Ingresses to handle
    #[arg(long, default_value = "f5")]
    ingress_class: String,
    /// controller name expected in IngressClass resources
    #[arg(long, default_value = "f5.com/cis-ingress-controller")]
    controller_name: String,
    /// bind address of Ingresses without one
    #[arg(long, default_value = "")]
    default_ingress_ip: String,
    #[arg(long, default_value = "")]
    vs_snat_pool_name: String,
    #[arg(long, default_value = "k8s")]
    partition: String,
    /// resolve the first host of Ingresses without a bind address: LOOKUP or a DNS server
    #[arg(long)]
    resolve_ingress_names: Option<HostResolver>,
    #[arg(long)]
    no_api: bool,
    #[arg(long, default_value = "127.0.0.1:2287")]
    api: std::net::SocketAddr,
}
impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            ingress_class: self.ingress_class.clone(),
            controller_name: self.controller_name.clone(),
            default_ingress_ip: self.default_ingress_ip.clone(),
            snat_pool_name: self.vs_snat_pool_name.clone(),
            partition: self.partition.clone(),
            resolve_ingress: self.resolve_ingress_names.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("RUST_LOG", "info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    if let Some(ns) = &cli.namespace {
        info!("starting for namespace {ns}");
    } else {
        info!("starting for all namespaces");
    };
    info!(
        "handling ingress class {} of controller {}",
        cli.ingress_class, cli.controller_name
    );

    let client: Client = kube::Config::infer().await?.try_into()?;

    let objects = Arc::new(WatchedObjects::default());
    let events = Arc::new(KubeEvents::new(client.clone(), &cli.controller_name));
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let store = ResourceStore::default();

    let (manager, mut deploy_rx) = Manager::new(
        cli.controller_config(),
        store.clone(),
        objects.clone(),
        events,
        cluster,
    );

    let watcher_config = watcher::Config::default();
    let mut watcher = KubeWatcher::new(client, watcher_config, cli.namespace, objects, manager);

    tokio::spawn(async move {
        if let Err(e) = watcher.run(Duration::from_secs(1)).await {
            panic!("k8s watcher failed: {e}");
        }
    });

    if !cli.no_api {
        tokio::spawn(api_server(cli.api, store.clone()));
    }

    loop {
        deploy_rx.changed().await?;
        let generation = *deploy_rx.borrow_and_update();
        info!("configuration {generation} ready");

        if log_enabled!(log::Level::Debug) {
            let resources = store.lock().await;
            let mut buf = Vec::new();

            for (name, cfg) in &resources.configs {
                let vs = &cfg.virtual_server;
                match vs.address.as_ref() {
                    Some(addr) => writeln!(buf, "- {name} on {}:{}", addr.bind_addr, addr.port)?,
                    None => writeln!(buf, "- {name} (pools only)")?,
                }
                writeln!(buf, "  owner: {}", cfg.meta.ingress)?;
                if !vs.pool_name.is_empty() {
                    writeln!(buf, "  default pool: {}", vs.pool_name)?;
                }
                for pool in &cfg.pools {
                    writeln!(
                        buf,
                        "  pool {} => {}:{} [{}]",
                        pool.name,
                        pool.service_name,
                        pool.service_port,
                        pool.monitor_names.iter().join(", ")
                    )?;
                }
                for rule in cfg.policy().into_iter().flat_map(|p| p.by_ordinal()) {
                    writeln!(
                        buf,
                        "  {:>3} {} => {}",
                        rule.ordinal,
                        rule.full_uri,
                        rule.forward_pools().join(", ")
                    )?;
                }
                if !vs.irules.is_empty() {
                    writeln!(buf, "  irules: {}", vs.irules.iter().join(", "))?;
                }
            }

            debug!("new config:\n{}", String::from_utf8_lossy(&buf));
        }
    }
}

async fn api_server(bind: impl Into<std::net::SocketAddr>, store: ResourceStore) {
    use warp::Filter;

    let server = warp::get()
        .map(move || store.clone())
        .and_then(|store: ResourceStore| async move {
            let snapshot = store.snapshot().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&snapshot))
        });

    warp::serve(server).try_bind(bind).await;
}

struct KubeWatcher {
    client: Client,
    watcher_config: watcher::Config,
    state: WatcherState,
    namespace: Option<String>,
    objects: Arc<WatchedObjects>,
    manager: Manager<KubeCluster>,
    /// Ingresses handed to the manager, to spot deletions missed while not watching
    synced: Set<ObjectKey>,
}
impl KubeWatcher {
    fn new(
        client: Client,
        watcher_config: watcher::Config,
        namespace: Option<String>,
        objects: Arc<WatchedObjects>,
        manager: Manager<KubeCluster>,
    ) -> Self {
        Self {
            client,
            watcher_config,
            namespace,
            objects,
            manager,
            state: WatcherState::default(),
            synced: Set::new(),
        }
    }

    async fn run(&mut self, retry_delay: Duration) -> eyre::Result<()> {
        loop {
            let Err(e) = self.run_once().await else {
                break;
            };

            error!("kubernetes watcher failed (retrying): {e}");
            tokio::time::sleep(retry_delay).await;
        }
        Ok(())
    }

    async fn run_once(&mut self) -> eyre::Result<()> {
        let mut streams = match &self.namespace {
            None => WatcherStreams::all(&self.client, &self.watcher_config),
            Some(ns) => WatcherStreams::namespaced(&self.client, &self.watcher_config, ns.as_str()),
        };
        let mut was_ready = false;

        self.state = WatcherState::default();

        loop {
            let change = self.state.ingest_any_event(&mut streams, &self.objects).await?;

            let is_ready = self.state.is_ready();

            if is_ready && !was_ready {
                info!("all required objects received");
                was_ready = true;
                self.sync_all().await;
                continue;
            } else if !is_ready && was_ready {
                info!("k8s watches restarted");
            }
            was_ready = is_ready;
            if !is_ready {
                continue;
            }

            match change {
                Change::None => {}
                Change::Ingress(key, Some(ing)) => self.sync(&key, &ing).await,
                Change::Ingress(key, None) => {
                    self.manager.remove_ingress(&key).await;
                    self.synced.remove(&key);
                }
                Change::Service(key) => {
                    let ingresses = self.ingresses();
                    let using = (ingresses.iter()).filter(|(_, ing)| references_service(ing, &key));
                    for (ing_key, ing) in using {
                        debug!("{ing_key}: service {key} changed");
                        self.sync(ing_key, ing).await;
                    }
                }
                Change::Class(name) => {
                    debug!("ingress class {name} changed");
                    self.sync_all().await;
                }
            }
        }
    }

    fn ingresses(&self) -> Map<ObjectKey, Arc<networking::Ingress>> {
        let ingresses = self.objects.ingresses.read();
        ingresses.unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn sync(&mut self, key: &ObjectKey, ing: &networking::Ingress) {
        match self.manager.sync_ingress(ing).await {
            Ok(_) => {
                self.synced.insert(key.clone());
            }
            Err(e) => error!("{key}: sync failed: {e}"),
        }
    }

    /// Syncs every known Ingress, and removes the ones that disappeared while not watching.
    async fn sync_all(&mut self) {
        let ingresses = self.ingresses();

        let gone: Vec<_> = (self.synced.iter())
            .filter(|key| !ingresses.contains_key(key))
            .cloned()
            .collect();
        for key in gone {
            info!("{key}: gone");
            self.manager.remove_ingress(&key).await;
            self.synced.remove(&key);
        }

        for (key, ing) in &ingresses {
            self.sync(key, ing).await;
        }
    }
}

/// Whether `ing` has a backend on the service `key`.
fn references_service(ing: &networking::Ingress, key: &ObjectKey) -> bool {
    if ing.metadata.namespace.as_deref() != Some(key.namespace.as_str()) {
        return false;
    }
    let Some(spec) = ing.spec.as_ref() else {
        return false;
    };
    let paths = (spec.rules.iter().flatten())
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| http.paths.iter())
        .map(|path| &path.backend);

    (spec.default_backend.iter())
        .chain(paths)
        .filter_map(|backend| backend.service.as_ref())
        .any(|svc| svc.name == key.name)
}

type Stream<T> =
    std::pin::Pin<Box<dyn futures::Stream<Item = watcher::Result<watcher::Event<T>>> + Send>>;

struct WatcherStreams {
    svc: Stream<core::Service>,
    ing: Stream<networking::Ingress>,
    class: Stream<networking::IngressClass>,
}
impl WatcherStreams {
    fn all(client: &Client, watcher_config: &watcher::Config) -> Self {
        let svcs = Api::<core::Service>::all(client.clone());
        let svc = watcher(svcs, watcher_config.clone()).boxed();

        let ings = Api::<networking::Ingress>::all(client.clone());
        let ing = watcher(ings, watcher_config.clone()).boxed();

        Self {
            svc,
            ing,
            class: Self::classes(client, watcher_config),
        }
    }

    fn namespaced(client: &Client, watcher_config: &watcher::Config, namespace: &str) -> Self {
        let svcs = Api::<core::Service>::namespaced(client.clone(), namespace);
        let svc = watcher(svcs, watcher_config.clone()).boxed();

        let ings = Api::<networking::Ingress>::namespaced(client.clone(), namespace);
        let ing = watcher(ings, watcher_config.clone()).boxed();

        Self {
            svc,
            ing,
            class: Self::classes(client, watcher_config),
        }
    }

    /// IngressClasses are cluster scoped.
    fn classes(client: &Client, watcher_config: &watcher::Config) -> Stream<networking::IngressClass> {
        let classes = Api::<networking::IngressClass>::all(client.clone());
        watcher(classes, watcher_config.clone()).boxed()
    }
}

/// What an event changed, once the watches are ready.
enum Change {
    None,
    Service(ObjectKey),
    Ingress(ObjectKey, Option<Arc<networking::Ingress>>),
    Class(String),
}

#[derive(Default)]
struct WatcherState {
    svcs_ready: bool,
    ings_ready: bool,
    classes_ready: bool,
}
impl WatcherState {
    fn is_ready(&self) -> bool {
        self.svcs_ready && self.ings_ready && self.classes_ready
    }

    async fn ingest_any_event(
        &mut self,
        streams: &mut WatcherStreams,
        objects: &WatchedObjects,
    ) -> eyre::Result<Change> {
        let change = tokio::select!(
          e = streams.svc.try_next() => {
              let e = e?.ok_or_else(|| eyre::format_err!("service watch ended"))?;
              trace!("got svc event: {e:?}");
              let (ready, changed) = ingest_event(&objects.services, e, namespaced_key);
              self.svcs_ready = ready;
              changed.map_or(Change::None, |(key, _)| Change::Service(key))
          },
          e = streams.ing.try_next() => {
              let e = e?.ok_or_else(|| eyre::format_err!("ingress watch ended"))?;
              trace!("got ing event: {e:?}");
              let (ready, changed) = ingest_event(&objects.ingresses, e, namespaced_key);
              self.ings_ready = ready;
              changed.map_or(Change::None, |(key, ing)| Change::Ingress(key, ing))
          },
          e = streams.class.try_next() => {
              let e = e?.ok_or_else(|| eyre::format_err!("ingress class watch ended"))?;
              trace!("got class event: {e:?}");
              let (ready, changed) = ingest_event(&objects.classes, e, class_key);
              self.classes_ready = ready;
              changed.map_or(Change::None, |(key, _)| Change::Class(key.name))
          },
        );
        Ok(change)
    }
}

fn namespaced_key<K: kube::Resource>(v: &K) -> Option<ObjectKey> {
    ObjectKey::try_from(kube::Resource::meta(v)).ok()
}

fn class_key(class: &networking::IngressClass) -> Option<ObjectKey> {
    let name = class.metadata.name.clone()?;
    Some(ObjectKey::new("", name))
}

/// Applies `event` to `map`. Returns whether the watch is ready, and the key and new value of
/// the object that changed (no value on deletion).
fn ingest_event<T>(
    map: &RwLock<Map<ObjectKey, Arc<T>>>,
    event: watcher::Event<T>,
    key_from: impl Fn(&T) -> Option<ObjectKey>,
) -> (bool, Option<(ObjectKey, Option<Arc<T>>)>) {
    use watcher::Event::*;
    let mut map = map.write().unwrap_or_else(|e| e.into_inner());
    match event {
        Init => {
            map.clear();
            (false, None)
        }
        InitApply(v) => {
            if let Some(key) = key_from(&v) {
                map.insert(key, Arc::new(v));
            }
            (false, None)
        }
        InitDone => (true, None),
        Apply(v) => {
            let Some(key) = key_from(&v) else {
                return (true, None);
            };
            let v = Arc::new(v);
            map.insert(key.clone(), v.clone());
            (true, Some((key, Some(v))))
        }
        Delete(v) => {
            let Some(key) = key_from(&v) else {
                return (true, None);
            };
            map.remove(&key);
            (true, Some((key, None)))
        }
    }
}
