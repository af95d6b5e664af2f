use super::*;

#[test]
fn test_vs_names() {
    assert_eq!("ingress_10-0-0-5_80", format_vs_name("10.0.0.5", 80));
    assert_eq!("ingress_10-0-0-5.2_443", format_vs_name("10.0.0.5%2", 443));
    assert_eq!("ingress_2001-db8--1_80", format_vs_name("[2001:db8::1]", 80));
    assert_eq!("ingress__80", format_vs_name("", 80));
}

#[test]
fn test_pool_and_rule_names() {
    let pool = format_pool_name("default", "svc-a", &PortRef::Number(80));
    assert_eq!("ingress_default_svc-a_80", pool);
    assert_eq!(
        "ingress_default_svc-a_http",
        format_pool_name("default", "svc-a", &PortRef::Name("http".into()))
    );

    assert_eq!(
        "ingress_foo.com_a_b_p",
        format_rule_name("foo.com", "/a/b", "p")
    );
    assert_eq!("ingress_foo.com__p", format_rule_name("foo.com", "/", "p"));
    assert_eq!("ingress_foo.com_p", format_rule_name("foo.com", "", "p"));
}

#[test]
fn test_paths_and_route_domains() {
    assert_eq!("/k8s/pool", join_path("k8s", "pool"));
    assert_eq!("10.0.0.5", split_route_domain("10.0.0.5%2"));
    assert_eq!("10.0.0.5", split_route_domain("10.0.0.5"));
}

#[test]
fn test_object_keys() {
    let meta = meta::ObjectMeta {
        namespace: Some("ns".into()),
        name: Some("web".into()),
        ..Default::default()
    };
    let key = ObjectKey::try_from(&meta).unwrap();
    assert_eq!(ObjectKey::new("ns", "web"), key);
    assert_eq!("ns/web", key.to_string());

    assert!(ObjectKey::try_from(&meta::ObjectMeta::default()).is_err());
}

#[test]
fn test_backend_ports() {
    let backend = Backend::from_backend(&testing::backend("svc-a", 8080)).unwrap();
    assert_eq!("svc-a", backend.service);
    assert_eq!(PortRef::Number(8080), backend.port);

    assert_eq!(None, Backend::from_backend(&testing::backend("svc-a", 70000)));
    assert_eq!(None, Backend::from_backend(&testing::backend("svc-a", -1)));
}
