use super::*;
use crate::{
    ControllerConfig, annotations, merge,
    ports::{self, virtual_ports},
    store::Resources,
    synth::synthesize,
    testing::{self, MemoryEvents, MemoryIndex},
};

struct Fixture {
    ing: networking::Ingress,
    key: ObjectKey,
    ann: IngressAnnotations,
    secrets: Map<ObjectKey, Option<core::Secret>>,
    events: MemoryEvents,
    resources: Resources,
}

impl Fixture {
    fn new(ing: networking::Ingress, bind_addr: &str) -> Self {
        let key = ObjectKey::try_from(&ing.metadata).unwrap();
        let ann = IngressAnnotations::parse(crate::annotations(&ing));
        let index = MemoryIndex::default()
            .with_service("default", "svc-a")
            .with_service("default", "svc-b");
        let config = ControllerConfig::default();

        let mut resources = Resources::default();
        for port in virtual_ports(&ann, ports::has_tls(&ing, &ann)) {
            let draft = synthesize(&ing, &key, &ann, port.port, bind_addr, &config, &index);
            merge::merge(&mut resources, draft.unwrap().unwrap(), "");
        }

        Self {
            ing,
            key,
            ann,
            secrets: Map::new(),
            events: MemoryEvents::default(),
            resources,
        }
    }

    fn with_secret(mut self, name: &str, secret: Option<core::Secret>) -> Self {
        self.secrets.insert(ObjectKey::new("default", name), secret);
        self
    }

    /// Applies TLS to the virtual listening on `port`.
    fn apply(&mut self, vs: &str, protocol: Protocol, fwd: &mut ServiceFwdRuleMap) -> bool {
        let ctx = TlsContext {
            ing: &self.ing,
            key: &self.key,
            ann: &self.ann,
            state: TlsState::of(ports::has_tls(&self.ing, &self.ann), &self.ann),
            secrets: &self.secrets,
            events: &self.events,
        };
        let port = match protocol {
            Protocol::Http => self.ann.http_port,
            Protocol::Https => self.ann.https_port,
        };
        let Resources { configs, shared } = &mut self.resources;
        let cfg = configs.get_mut(vs).unwrap();
        apply(cfg, shared, &ctx, VirtualPort { protocol, port }, fwd)
    }

    fn profiles(&self, vs: &str) -> Vec<(ProfileContext, &str, &str)> {
        let cfg = self.resources.get(vs).unwrap();
        (cfg.virtual_server.profiles.iter())
            .filter(|p| p.context != ProfileContext::All)
            .map(|p| (p.context, p.partition.as_str(), p.name.as_str()))
            .collect()
    }
}

const HTTP_VS: &str = "ingress_10-0-0-5_80";
const HTTPS_VS: &str = "ingress_10-0-0-5_443";

fn tls_ingress() -> networking::Ingress {
    let mut ing = testing::multi_service(
        "default",
        "web",
        &[
            ("web.example.com", "/a", "svc-a", 80),
            ("web.example.com", "/b", "svc-b", 80),
        ],
    );
    testing::with_tls(&mut ing, "web-cert", &["web.example.com"]);
    ing
}

#[test]
fn test_no_tls_does_nothing() {
    let ing = testing::multi_service("default", "web", &[("", "/a", "svc-a", 80)]);
    let mut f = Fixture::new(ing, "10.0.0.5");
    let before = f.resources.get(HTTP_VS).unwrap().clone();

    let mut fwd = ServiceFwdRuleMap::default();
    assert!(!f.apply(HTTP_VS, Protocol::Http, &mut fwd));
    assert_eq!(&before, f.resources.get(HTTP_VS).unwrap());
    assert!(fwd.is_empty());
}

#[test]
fn test_redirect_and_secret_profile() {
    let secret = testing::tls_secret("default", "web-cert");
    let mut f = Fixture::new(tls_ingress(), "10.0.0.5").with_secret("web-cert", Some(secret));
    let mut fwd = ServiceFwdRuleMap::default();

    // https leg
    assert!(f.apply(HTTPS_VS, Protocol::Https, &mut fwd));
    assert_eq!(
        vec![(ProfileContext::Client, "k8s", "web-cert")],
        f.profiles(HTTPS_VS)
    );
    let custom = &f.resources.shared.custom_profiles[&ObjectKey::new("default", "web-cert")];
    assert!(custom.cert.starts_with("-----BEGIN CERTIFICATE-----"));
    // unchanged secret
    assert!(!f.apply(HTTPS_VS, Protocol::Https, &mut fwd));
    assert!(fwd.is_empty());

    // http leg
    assert!(!f.apply(HTTP_VS, Protocol::Http, &mut fwd));
    let cfg = f.resources.get(HTTP_VS).unwrap();
    assert_eq!(
        vec!["/Common/http_redirect_irule_443".to_string()],
        cfg.virtual_server.irules
    );
    assert!(f.profiles(HTTP_VS).is_empty());
    let irule = &f.resources.shared.irules["/Common/http_redirect_irule_443"];
    assert!(irule.code.contains(HTTPS_REDIRECT_DG));

    assert_eq!(
        vec![
            ("default/svc-a", "web.example.com", "/a"),
            ("default/svc-b", "web.example.com", "/b"),
        ],
        fwd.entries().collect::<Vec<_>>()
    );

    // attaching again changes nothing
    f.apply(HTTP_VS, Protocol::Http, &mut fwd);
    assert_eq!(1, f.resources.get(HTTP_VS).unwrap().virtual_server.irules.len());

    assert!(apply_fwd_rules(&mut f.resources.shared, &fwd));
    assert!(!apply_fwd_rules(&mut f.resources.shared, &fwd));
    let dg = &f.resources.shared.internal_datagroups["/Common/https_redirect_dg"];
    assert_eq!(
        Some("default/svc-b"),
        dg.records.get("web.example.com/b").map(String::as_str)
    );
    assert!(f.events.reasons().is_empty());
}

#[test]
fn test_default_backend_is_redirected_for_any_host() {
    let mut ing = testing::single_service("default", "web", "svc-a", 80);
    testing::with_tls(&mut ing, "web-cert", &["web.example.com"]);
    let mut f = Fixture::new(ing, "10.0.0.5");

    let mut fwd = ServiceFwdRuleMap::default();
    f.apply(HTTP_VS, Protocol::Http, &mut fwd);
    assert_eq!(
        vec![("default/svc-a", "*", "/")],
        fwd.entries().collect::<Vec<_>>()
    );
}

#[test]
fn test_missing_secret_removes_profile() {
    let secret = testing::tls_secret("default", "web-cert");
    let mut f = Fixture::new(tls_ingress(), "10.0.0.5").with_secret("web-cert", Some(secret));
    let mut fwd = ServiceFwdRuleMap::default();
    f.apply(HTTPS_VS, Protocol::Https, &mut fwd);
    assert_eq!(1, f.profiles(HTTPS_VS).len());

    f = f.with_secret("web-cert", None);
    f.apply(HTTPS_VS, Protocol::Https, &mut fwd);
    assert!(f.profiles(HTTPS_VS).is_empty());
    assert_eq!(vec![reasons::SECRET_NOT_FOUND], f.events.reasons());
    assert!(f.events.events()[0].warning);
}

#[test]
fn test_invalid_secret_is_skipped() {
    let mut secret = testing::tls_secret("default", "web-cert");
    let data = secret.data.as_mut().unwrap();
    data.insert(
        "tls.crt".into(),
        k8s_openapi::ByteString(b"not a certificate".to_vec()),
    );
    let mut f = Fixture::new(tls_ingress(), "10.0.0.5").with_secret("web-cert", Some(secret));

    let mut fwd = ServiceFwdRuleMap::default();
    assert!(!f.apply(HTTPS_VS, Protocol::Https, &mut fwd));
    assert!(f.profiles(HTTPS_VS).is_empty());
    assert!(f.resources.shared.custom_profiles.is_empty());
}

#[test]
fn test_annotated_profiles() {
    let mut ing = testing::multi_service("default", "web", &[("", "/a", "svc-a", 80)]);
    testing::annotate(
        &mut ing,
        annotations::CLIENT_SSL,
        r#"[{"bigipProfile": "/Common/clientssl"}, {"bigipProfile": "k8s/mine"}]"#,
    );
    testing::annotate(&mut ing, annotations::SERVER_SSL, "serverssl");
    let mut f = Fixture::new(ing, "10.0.0.5");

    let mut fwd = ServiceFwdRuleMap::default();
    assert!(!f.apply(HTTPS_VS, Protocol::Https, &mut fwd));
    assert_eq!(
        vec![
            (ProfileContext::Client, "Common", "clientssl"),
            (ProfileContext::Client, "k8s", "mine"),
            (ProfileContext::Server, "Common", "serverssl"),
        ],
        f.profiles(HTTPS_VS)
    );
}

#[test]
fn test_allow_http_keeps_http_plain() {
    let mut ing = tls_ingress();
    testing::annotate(&mut ing, annotations::SSL_REDIRECT, "false");
    testing::annotate(&mut ing, annotations::ALLOW_HTTP, "true");
    let mut f = Fixture::new(ing, "10.0.0.5");

    let mut fwd = ServiceFwdRuleMap::default();
    f.apply(HTTP_VS, Protocol::Http, &mut fwd);
    assert!(f.resources.get(HTTP_VS).unwrap().virtual_server.irules.is_empty());
    assert!(fwd.is_empty());
    assert!(f.resources.shared.irules.is_empty());
}

#[test]
fn test_pool_only_mode_is_skipped() {
    let mut f = Fixture::new(tls_ingress(), "");
    let mut fwd = ServiceFwdRuleMap::default();
    let vs = "ingress__80";
    assert!(!f.apply(vs, Protocol::Http, &mut fwd));
    assert!(f.resources.get(vs).unwrap().virtual_server.irules.is_empty());
    assert!(fwd.is_empty());
}

#[test]
fn test_redirect_port_in_irule() {
    assert!(redirect_irule_code(443).contains("HTTP::redirect https://[getfield [HTTP::host] \":\" 1][HTTP::uri]"));
    assert!(redirect_irule_code(8443).contains(":8443[HTTP::uri]"));
}

#[test]
fn test_redirect_is_detached_when_http_is_allowed() {
    let mut f = Fixture::new(tls_ingress(), "10.0.0.5");
    let mut fwd = ServiceFwdRuleMap::default();
    f.apply(HTTP_VS, Protocol::Http, &mut fwd);
    assert_eq!(1, f.resources.get(HTTP_VS).unwrap().virtual_server.irules.len());

    testing::annotate(&mut f.ing, annotations::SSL_REDIRECT, "false");
    testing::annotate(&mut f.ing, annotations::ALLOW_HTTP, "true");
    f.ann = IngressAnnotations::parse(crate::annotations(&f.ing));
    f.apply(HTTP_VS, Protocol::Http, &mut ServiceFwdRuleMap::default());

    let cfg = f.resources.get(HTTP_VS).unwrap();
    assert!(cfg.virtual_server.irules.is_empty());
    assert!(cfg.meta.contributions[&f.key].irules.is_empty());
}

#[test]
fn test_annotated_profiles_are_detached_once_dropped() {
    let mut ing = testing::multi_service("default", "web", &[("", "/a", "svc-a", 80)]);
    testing::annotate(&mut ing, annotations::CLIENT_SSL, r#"[{"bigipProfile": "clientssl"}]"#);
    testing::annotate(&mut ing, annotations::SERVER_SSL, "serverssl");
    let mut f = Fixture::new(ing, "10.0.0.5");
    let mut fwd = ServiceFwdRuleMap::default();
    f.apply(HTTPS_VS, Protocol::Https, &mut fwd);
    assert_eq!(2, f.profiles(HTTPS_VS).len());

    if let Some(map) = f.ing.metadata.annotations.as_mut() {
        map.remove(annotations::SERVER_SSL);
    }
    f.ann = IngressAnnotations::parse(crate::annotations(&f.ing));
    f.apply(HTTPS_VS, Protocol::Https, &mut fwd);
    assert_eq!(
        vec![(ProfileContext::Client, "Common", "clientssl")],
        f.profiles(HTTPS_VS)
    );

    f.ing.metadata.annotations = None;
    f.ann = IngressAnnotations::parse(crate::annotations(&f.ing));
    f.apply(HTTPS_VS, Protocol::Https, &mut fwd);
    assert!(f.profiles(HTTPS_VS).is_empty());
    // plain http profiles stay
    assert!(!f.resources.get(HTTPS_VS).unwrap().virtual_server.profiles.is_empty());
}
