//! The shared configuration store.

use serde::Serialize;
use std::collections::BTreeMap as Map;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    ObjectKey,
    model::{CustomProfile, IRule, InternalDataGroup, ResourceConfig, Rule, keys_as_strings},
};

/// Every virtual's configuration plus the objects shared between virtuals.
#[derive(Debug, Default, Serialize)]
pub struct Resources {
    /// virtual name => configuration
    pub configs: Map<String, ResourceConfig>,
    #[serde(flatten)]
    pub shared: SharedObjects,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SharedObjects {
    /// virtual name => injected rule name => where it was folded
    #[serde(skip)]
    pub merged_rules: Map<String, Map<String, MergedRule>>,
    pub irules: Map<String, IRule>,
    pub internal_datagroups: Map<String, InternalDataGroup>,
    /// secret => client profile built from it
    #[serde(serialize_with = "keys_as_strings")]
    pub custom_profiles: Map<ObjectKey, CustomProfile>,
}

/// An injected rule and the rule it was folded into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRule {
    pub rule: Rule,
    pub merged_with: String,
}

impl Resources {
    pub fn get(&self, name: &str) -> Option<&ResourceConfig> {
        self.configs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ResourceConfig> {
        self.configs.get_mut(name)
    }

    pub fn upsert(&mut self, cfg: ResourceConfig) {
        self.configs.insert(cfg.name().to_string(), cfg);
    }

    pub fn delete(&mut self, name: &str) -> Option<ResourceConfig> {
        self.shared.merged_rules.remove(name);
        self.configs.remove(name)
    }
}

/// Single-writer access to [`Resources`]. Every read-modify-write holds the lock throughout.
#[derive(Clone, Default)]
pub struct ResourceStore(Arc<Mutex<Resources>>);

impl ResourceStore {
    pub async fn lock(&self) -> MutexGuard<'_, Resources> {
        self.0.lock().await
    }

    /// JSON view of the whole store.
    pub async fn snapshot(&self) -> serde_json::Value {
        let resources = self.0.lock().await;
        serde_json::to_value(&*resources).unwrap_or_else(|e| {
            log::error!("failed to serialize the store: {e}");
            serde_json::Value::Null
        })
    }
}
