//! Load balancer configuration objects.

use itertools::Itertools;
use serde::Serialize;
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::{COMMON_PARTITION, ObjectKey, PortRef, join_path};

pub const RESOURCE_TYPE_INGRESS: &str = "ingress";

/// Configuration of one virtual server, with everything it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceConfig {
    #[serde(rename = "virtual")]
    pub virtual_server: Virtual,
    pub pools: Vec<Pool>,
    pub policies: Vec<Policy>,
    pub monitors: Vec<Monitor>,
    #[serde(rename = "metadata")]
    pub meta: MetaData,
}

impl ResourceConfig {
    pub fn name(&self) -> &str {
        &self.virtual_server.name
    }

    /// The forwarding policy, named after the virtual.
    pub fn policy(&self) -> Option<&Policy> {
        let name = &self.virtual_server.name;
        self.policies.iter().find(|p| &p.name == name)
    }

    pub fn policy_mut(&mut self) -> Option<&mut Policy> {
        let name = &self.virtual_server.name;
        self.policies.iter_mut().find(|p| &p.name == name)
    }

    pub fn set_policy(&mut self, policy: Policy) {
        match self.policies.iter_mut().find(|p| p.name == policy.name) {
            Some(p) => *p = policy,
            None => self.policies.push(policy),
        }
    }

    /// Appends a rule after every existing one.
    pub fn add_rule_to_policy(&mut self, mut rule: Rule) {
        let Some(policy) = self.policy_mut() else {
            return;
        };
        rule.ordinal = policy.rules.len();
        policy.rules.push(rule);
    }

    pub fn pool_by_path(&self, full_name: &str) -> Option<usize> {
        (self.pools.iter()).position(|p| p.full_name() == full_name)
    }

    /// Attaches `monitor` to the pool at `pool_idx`; returns whether anything changed.
    pub fn set_monitor(&mut self, pool_idx: usize, monitor: Monitor) -> bool {
        let mut updated = false;
        match self.monitors.iter_mut().find(|m| m.name == monitor.name) {
            Some(m) if *m == monitor => {}
            Some(m) => {
                *m = monitor.clone();
                updated = true;
            }
            None => {
                self.monitors.push(monitor.clone());
                updated = true;
            }
        }

        let full_name = join_path(&monitor.partition, &monitor.name);
        let pool = &mut self.pools[pool_idx];
        if !pool.monitor_names.contains(&full_name) {
            pool.monitor_names.push(full_name);
            updated = true;
        }
        updated
    }

    /// Drops monitors no pool references anymore.
    pub fn prune_monitors(&mut self) {
        let used: Set<String> = (self.pools.iter())
            .flat_map(|p| p.monitor_names.iter().cloned())
            .collect();
        (self.monitors).retain(|m| used.contains(&join_path(&m.partition, &m.name)));
    }

    /// Records the iRules and profiles `ingress` attaches now, and detaches the ones it
    /// attached before that no contributor holds anymore.
    pub fn set_tls_attachments(
        &mut self,
        ingress: &ObjectKey,
        irules: Set<String>,
        profiles: Set<ProfileRef>,
    ) {
        let contribution = self.meta.contributions.entry(ingress.clone()).or_default();
        let irules = std::mem::replace(&mut contribution.irules, irules);
        let profiles = std::mem::replace(&mut contribution.profiles, profiles);
        self.detach_irules(&irules);
        self.detach_profiles(&profiles);
    }

    /// Same as [`Self::set_tls_attachments`] for monitor bindings.
    pub fn set_monitor_bindings(&mut self, ingress: &ObjectKey, monitors: Set<MonitorBinding>) {
        let contribution = self.meta.contributions.entry(ingress.clone()).or_default();
        let monitors = std::mem::replace(&mut contribution.monitors, monitors);
        self.detach_monitors(&monitors);
    }

    pub fn detach_irules(&mut self, irules: &Set<String>) {
        let stale: Set<&String> = (irules.iter())
            .filter(|name| !self.meta.references_irule(name))
            .collect();
        (self.virtual_server.irules).retain(|name| !stale.contains(name));
    }

    pub fn detach_profiles(&mut self, profiles: &Set<ProfileRef>) {
        let stale: Vec<&ProfileRef> = (profiles.iter())
            .filter(|profile| !self.meta.references_profile(profile))
            .collect();
        for profile in stale {
            self.virtual_server.remove_profile(profile);
        }
    }

    pub fn detach_monitors(&mut self, monitors: &Set<MonitorBinding>) {
        let stale: Vec<&MonitorBinding> = (monitors.iter())
            .filter(|binding| !self.meta.references_monitor(binding))
            .collect();
        for (pool, monitor) in stale {
            if let Some(pool) = self.pools.iter_mut().find(|p| &p.name == pool) {
                pool.monitor_names.retain(|name| name != monitor);
            }
        }
        self.prune_monitors();
    }

    /// Reorders rules by descending full URI; ordinals are left untouched.
    pub fn sort_rules(&mut self) {
        for policy in &mut self.policies {
            policy.sort_rules();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Virtual {
    pub name: String,
    pub partition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<VirtualAddress>,
    /// Default pool, only for a single-service virtual.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pool_name: String,
    pub profiles: Set<ProfileRef>,
    pub irules: Vec<String>,
    pub source_address_translation: SourceAddressTranslation,
    pub enabled: bool,
}

impl Virtual {
    pub fn new(name: String, partition: String) -> Self {
        Self {
            name,
            partition,
            address: None,
            pool_name: String::new(),
            profiles: Set::new(),
            irules: Vec::new(),
            source_address_translation: SourceAddressTranslation::Automap,
            enabled: false,
        }
    }

    /// Empty in pool-only mode.
    pub fn bind_addr(&self) -> &str {
        self.address.as_ref().map_or("", |a| a.bind_addr.as_str())
    }

    pub fn set_address(&mut self, bind_addr: &str, port: i32) {
        if bind_addr.is_empty() {
            self.address = None;
            return;
        }
        self.address = Some(VirtualAddress {
            bind_addr: bind_addr.to_string(),
            port,
        });
    }

    /// Profiles for plain HTTP load balancing.
    pub fn set_http_profiles(&mut self) {
        for name in ["http", "tcp"] {
            self.add_or_update_profile(ProfileRef {
                context: ProfileContext::All,
                partition: COMMON_PARTITION.into(),
                name: name.into(),
                namespace: None,
            });
        }
    }

    pub fn add_or_update_profile(&mut self, profile: ProfileRef) -> bool {
        if self.profiles.contains(&profile) {
            return false;
        }
        self.profiles.retain(|p| !p.same_profile(&profile));
        self.profiles.insert(profile);
        true
    }

    pub fn remove_profile(&mut self, profile: &ProfileRef) -> bool {
        let before = self.profiles.len();
        self.profiles.retain(|p| !p.same_profile(profile));
        self.profiles.len() != before
    }

    pub fn add_irule(&mut self, name: String) -> bool {
        if self.irules.contains(&name) {
            return false;
        }
        self.irules.push(name);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualAddress {
    pub bind_addr: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceAddressTranslation {
    Automap,
    Snat { pool: String },
}
impl SourceAddressTranslation {
    pub fn for_snat_pool(snat_pool_name: &str) -> Self {
        if snat_pool_name.is_empty() {
            Self::Automap
        } else {
            Self::Snat {
                pool: snat_pool_name.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileContext {
    All,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ProfileRef {
    pub context: ProfileContext,
    pub partition: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}
impl ProfileRef {
    /// Reads `/partition/name`, `partition/name` or a bare name (in the common partition).
    pub fn parse(profile: &str, context: ProfileContext, namespace: &str) -> Self {
        let profile = profile.trim();
        let profile = profile.strip_prefix('/').unwrap_or(profile);
        let (partition, name) = profile
            .split_once('/')
            .unwrap_or((COMMON_PARTITION, profile));
        Self {
            context,
            partition: partition.to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
        }
    }

    fn same_profile(&self, other: &Self) -> bool {
        self.context == other.context && self.partition == other.partition && self.name == other.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pool {
    pub name: String,
    pub partition: String,
    pub balance: String,
    pub service_name: String,
    pub service_port: PortRef,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub monitor_names: Vec<String>,
}
impl Pool {
    pub fn full_name(&self) -> String {
        join_path(&self.partition, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub name: String,
    pub partition: String,
    pub strategy: String,
    pub rules: Vec<Rule>,
}

impl Policy {
    pub fn new(name: String, partition: String, rules: Vec<Rule>) -> Self {
        Self {
            name,
            partition,
            strategy: "first-match".into(),
            rules,
        }
    }

    pub fn sort_rules(&mut self) {
        self.rules.sort_by(|a, b| b.full_uri.cmp(&a.full_uri));
    }

    /// Renumbers ordinals to `0..n`, keeping their relative order.
    pub fn compact_ordinals(&mut self) {
        let order: Vec<usize> = (0..self.rules.len())
            .sorted_by_key(|&i| self.rules[i].ordinal)
            .collect();
        for (ordinal, i) in order.into_iter().enumerate() {
            self.rules[i].ordinal = ordinal;
        }
    }

    /// Rules in evaluation order.
    pub fn by_ordinal(&self) -> Vec<&Rule> {
        self.rules.iter().sorted_by_key(|r| r.ordinal).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub name: String,
    pub full_uri: String,
    pub ordinal: usize,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

impl Rule {
    /// Splits the full URI into host and path; a URI without a path matches `/`.
    pub fn host_path(&self) -> (&str, &str) {
        match self.full_uri.find('/') {
            Some(pos) => self.full_uri.split_at(pos),
            None => (self.full_uri.as_str(), "/"),
        }
    }

    pub fn forward_pools(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|a| match a {
            Action::Forward { pool } if !pool.is_empty() => Some(pool.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub subject: MatchSubject,
    pub operator: MatchOperator,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchSubject {
    HttpHost,
    HttpPath,
    /// 1-based path segment
    PathSegment(usize),
    TcpAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchOperator {
    Equals,
    EndsWith,
    StartsWith,
    Matches,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    Forward { pool: String },
    Redirect { location: String },
    ReplaceHost { value: String },
    ReplacePath { path: String, value: String },
}
impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Forward { pool } => write!(f, "forward {pool}"),
            Self::Redirect { location } => write!(f, "redirect {location}"),
            Self::ReplaceHost { value } => write!(f, "host := {value}"),
            Self::ReplacePath { path, value } => write!(f, "{path} := {value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Monitor {
    pub name: String,
    pub partition: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub interval: i32,
    pub timeout: i32,
    pub send: String,
    pub recv: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaData {
    pub resource_type: String,
    /// Ingress owning the virtual, the last single-service one if any.
    pub ingress: ObjectKey,
    #[serde(serialize_with = "keys_as_strings")]
    pub contributions: Map<ObjectKey, Contribution>,
}

/// A monitor bound to a pool: `(pool name, monitor full name)`.
pub type MonitorBinding = (String, String);

/// What one Ingress put into a shared virtual.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Contribution {
    pub single_service: bool,
    pub pools: Set<String>,
    pub rules: Set<String>,
    /// iRules attached to the virtual
    pub irules: Set<String>,
    /// TLS profiles attached to the virtual
    pub profiles: Set<ProfileRef>,
    pub monitors: Set<MonitorBinding>,
}

impl MetaData {
    pub fn references_pool(&self, name: &str) -> bool {
        self.contributions.values().any(|c| c.pools.contains(name))
    }
    pub fn references_rule(&self, name: &str) -> bool {
        self.contributions.values().any(|c| c.rules.contains(name))
    }
    pub fn references_irule(&self, name: &str) -> bool {
        self.contributions.values().any(|c| c.irules.contains(name))
    }
    pub fn references_profile(&self, profile: &ProfileRef) -> bool {
        (self.contributions.values())
            .any(|c| c.profiles.iter().any(|p| p.same_profile(profile)))
    }
    pub fn references_monitor(&self, binding: &MonitorBinding) -> bool {
        self.contributions.values().any(|c| c.monitors.contains(binding))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IRule {
    pub name: String,
    pub partition: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InternalDataGroup {
    pub name: String,
    pub partition: String,
    /// record name => data
    pub records: Map<String, String>,
}

/// Client profile built from a TLS secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomProfile {
    pub name: String,
    pub partition: String,
    pub namespace: String,
    pub context: ProfileContext,
    pub cert: String,
    #[serde(skip_serializing)]
    pub key: String,
}

/// Serializes a map with displayable keys, JSON only accepting string keys.
pub(crate) fn keys_as_strings<K, V, S>(map: &Map<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    K: std::fmt::Display,
    V: Serialize,
    S: serde::Serializer,
{
    serializer.collect_map(map.iter().map(|(k, v)| (k.to_string(), v)))
}
