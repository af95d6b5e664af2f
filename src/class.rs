//! Ingress class admission.

use k8s_openapi::api::networking::v1 as networking;
use log::{debug, warn};

use crate::{ControllerConfig, annotations, cluster::ObjectIndex};

/// What the controller needs to know about an IngressClass resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressClassInfo {
    pub name: String,
    pub controller: String,
    pub is_default: bool,
}

impl From<&networking::IngressClass> for IngressClassInfo {
    fn from(class: &networking::IngressClass) -> Self {
        let is_default = (class.metadata.annotations.as_ref())
            .and_then(|a| a.get(annotations::DEFAULT_INGRESS_CLASS))
            .and_then(|v| annotations::parse_bool(v))
            .unwrap_or(false);
        Self {
            name: class.metadata.name.clone().unwrap_or_default(),
            controller: (class.spec.as_ref())
                .and_then(|s| s.controller.clone())
                .unwrap_or_default(),
            is_default,
        }
    }
}

/// Whether this controller instance handles `ing`.
///
/// The legacy class annotation wins, then `spec.ingressClassName`, then the configured
/// class being the cluster default.
pub fn is_managed(
    ing: &networking::Ingress,
    annotated_class: Option<&str>,
    config: &ControllerConfig,
    index: &dyn ObjectIndex,
) -> bool {
    if let Some(class) = annotated_class {
        return class == config.ingress_class;
    }

    let spec_class = (ing.spec.as_ref()).and_then(|s| s.ingress_class_name.as_deref());
    match spec_class {
        Some(name) => verify_class(name, config, index),
        None => verify_default_class(config, index),
    }
}

/// `name` is the configured class and that class belongs to this controller.
pub fn verify_class(name: &str, config: &ControllerConfig, index: &dyn ObjectIndex) -> bool {
    if name != config.ingress_class {
        return false;
    }
    let Some(class) = index.ingress_class(name) else {
        warn!("ingress class {name} not found");
        return false;
    };
    if class.controller != config.controller_name {
        debug!(
            "ingress class {name} is handled by {}, not {}",
            class.controller, config.controller_name
        );
        return false;
    }
    true
}

pub fn verify_default_class(config: &ControllerConfig, index: &dyn ObjectIndex) -> bool {
    let Some(class) = index.ingress_class(&config.ingress_class) else {
        debug!("ingress class {} not found", config.ingress_class);
        return false;
    };
    class.is_default
}
