
use std::collections::BTreeMap;
use std::time::Duration;

use harness::{can_connect, socket_addr, TestMux, API_SERVER, ETCD_MEMBER, HOST};
use tokio::time::Instant;
use wklmux::{ClusterEndpoint, MuxError};

fn endpoint(name: &str, port: u16) -> ClusterEndpoint {
    ClusterEndpoint {
        name: name.to_string(),
        host: HOST.to_string(),
        port,
    }
}

#[tokio::test]
async fn ports_are_unique_and_increasing() {
    let t = TestMux::spawn(5).await;

    let mut ports = Vec::new();
    for name in ["a", "b", "c", "d"] {
        ports.push(t.mux.init_listener(name).await.unwrap().port);
    }

    assert_eq!(ports[0], t.range.min);
    assert!(ports.windows(2).all(|w| w[0] < w[1]));

    // Re-initializing returns the reservation without consuming a port.
    assert_eq!(t.mux.init_listener("b").await.unwrap().port, ports[1]);
    assert_eq!(t.mux.init_listener("e").await.unwrap().port, ports[3] + 1);

    t.shutdown().await;
}

#[tokio::test]
async fn single_port_range_exhausts() {
    let t = TestMux::spawn(1).await;

    let first = t.mux.init_listener("a").await.unwrap();
    assert_eq!(first.port, t.range.min);

    let err = t.mux.init_listener("b").await.unwrap_err();
    assert!(err.is_exhausted(), "unexpected error: {err}");

    t.shutdown().await;
}

#[tokio::test]
async fn socket_is_bound_by_first_api_server() {
    let t = TestMux::spawn(2).await;

    let info = t.mux.init_listener("wkl-1").await.unwrap();
    let addr = socket_addr(&info);
    assert!(!can_connect(addr).await);
    assert!(!t.mux.is_listening("wkl-1").await);

    // etcd members never bind the socket.
    t.mux
        .add_etcd_member("wkl-1", ETCD_MEMBER, &t.ca)
        .await
        .unwrap();
    assert!(!can_connect(addr).await);

    t.mux
        .add_api_server("wkl-1", API_SERVER, &t.ca)
        .await
        .unwrap();
    assert!(t.mux.is_listening("wkl-1").await);
    assert!(can_connect(addr).await);

    t.shutdown().await;
}

#[tokio::test]
async fn identities_require_initialized_listener() {
    let t = TestMux::spawn(1).await;

    let err = t
        .mux
        .add_api_server("missing", API_SERVER, &t.ca)
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::NotInitialized { .. }));

    let err = t
        .mux
        .add_etcd_member("missing", ETCD_MEMBER, &t.ca)
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::NotInitialized { .. }));

    assert!(!t.mux.has_api_server("missing", API_SERVER).await);
    assert!(!t.mux.has_etcd_member("missing", ETCD_MEMBER).await);
    assert!(t.mux.list_listeners().await.is_empty());

    t.shutdown().await;
}

#[tokio::test]
async fn membership_is_idempotent() {
    let t = TestMux::spawn(1).await;
    t.start_cluster("wkl-1").await;

    let admin = t.mux.admin_credentials("wkl-1").await.unwrap();

    t.mux
        .add_api_server("wkl-1", API_SERVER, &t.ca)
        .await
        .unwrap();
    t.mux
        .add_etcd_member("wkl-1", ETCD_MEMBER, &t.ca)
        .await
        .unwrap();

    assert!(t.mux.has_api_server("wkl-1", API_SERVER).await);
    assert!(t.mux.has_etcd_member("wkl-1", ETCD_MEMBER).await);
    assert!(!t.mux.has_api_server("wkl-1", "kube-apiserver-1").await);

    let again = t.mux.admin_credentials("wkl-1").await.unwrap();
    assert_eq!(admin.cert_pem, again.cert_pem);
    assert_eq!(admin.ca_cert_pem, t.ca.cert_pem());

    t.shutdown().await;
}

#[tokio::test]
async fn different_ca_is_rejected() {
    let t = TestMux::spawn(1).await;
    t.start_cluster("wkl-1").await;

    let other_ca = wklmux_pki::CertificateAuthority::new("other CA").unwrap();
    let err = t
        .mux
        .add_api_server("wkl-1", "kube-apiserver-1", &other_ca)
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::CaMismatch { .. }));
    assert!(!t.mux.has_api_server("wkl-1", "kube-apiserver-1").await);

    t.shutdown().await;
}

#[tokio::test]
async fn bind_failure_can_be_retried() {
    let t = TestMux::spawn(1).await;
    let info = t.mux.init_listener("wkl-1").await.unwrap();

    let blocker = std::net::TcpListener::bind(info.host_port()).unwrap();
    let err = t
        .mux
        .add_api_server("wkl-1", API_SERVER, &t.ca)
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::Bind { .. }), "unexpected error: {err}");
    assert!(!t.mux.is_listening("wkl-1").await);
    // Callers that only join missing API servers must still retry.
    assert!(!t.mux.has_api_server("wkl-1", API_SERVER).await);

    drop(blocker);
    t.mux
        .add_api_server("wkl-1", API_SERVER, &t.ca)
        .await
        .unwrap();
    assert!(t.mux.is_listening("wkl-1").await);
    assert!(t.mux.has_api_server("wkl-1", API_SERVER).await);

    t.shutdown().await;
}

#[tokio::test]
async fn hot_restart_restores_ports() {
    let t = TestMux::spawn(12).await;
    let a = t.range.min + 5;
    let b = t.range.min + 10;

    let restored = t
        .mux
        .hot_restart(&[endpoint("A", a), endpoint("B", b)])
        .await
        .unwrap();
    assert_eq!(restored, 2);

    assert_eq!(t.mux.init_listener("A").await.unwrap().port, a);
    assert_eq!(t.mux.init_listener("B").await.unwrap().port, b);
    assert_eq!(t.mux.init_listener("C").await.unwrap().port, b + 1);

    // Restored clusters bind their original port when an API server re-joins.
    t.mux.add_api_server("B", API_SERVER, &t.ca).await.unwrap();
    assert!(can_connect(format!("{HOST}:{b}").parse().unwrap()).await);

    t.shutdown().await;
}

#[tokio::test]
async fn hot_restart_rejected_after_init() {
    let t = TestMux::spawn(3).await;
    let existing = t.mux.init_listener("existing").await.unwrap();

    let err = t
        .mux
        .hot_restart(&[endpoint("A", t.range.min + 2)])
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::AlreadyInitialized));

    let mut expected = BTreeMap::new();
    expected.insert("existing".to_string(), existing.address());
    assert_eq!(t.mux.list_listeners().await, expected);
    assert_eq!(t.mux.init_listener("next").await.unwrap().port, existing.port + 1);

    t.shutdown().await;
}

#[tokio::test]
async fn hot_restart_is_all_or_nothing() {
    let t = TestMux::spawn(3).await;

    let err = t
        .mux
        .hot_restart(&[
            endpoint("A", t.range.min + 1),
            ClusterEndpoint {
                name: "B".to_string(),
                host: "10.0.0.1".to_string(),
                port: t.range.min + 2,
            },
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::HostMismatch { .. }));

    let err = t
        .mux
        .hot_restart(&[endpoint("A", t.range.min + 1), endpoint("B", t.range.min + 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::DuplicatePort(_)));

    assert!(t.mux.endpoints().await.is_empty());
    assert_eq!(t.mux.init_listener("A").await.unwrap().port, t.range.min);

    t.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_every_port() {
    let t = TestMux::spawn(2).await;
    let a = t.start_cluster("a").await;
    let b = t.start_cluster("b").await;
    let debug_addr = t.mux.debug_address();

    assert!(can_connect(socket_addr(&a)).await);
    assert!(can_connect(debug_addr).await);

    t.shutdown().await;

    assert!(!can_connect(socket_addr(&a)).await);
    assert!(!can_connect(socket_addr(&b)).await);
    assert!(!can_connect(debug_addr).await);

    let err = t
        .mux
        .add_api_server("a", "kube-apiserver-1", &t.ca)
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::ShuttingDown));

    // A second shutdown is a no-op.
    let deadline = Instant::now() + Duration::from_secs(1);
    t.mux.shutdown(deadline).await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_open_connections() {
    let t = TestMux::spawn(1).await;
    let info = t.start_cluster("wkl-1").await;

    // An idle keep-alive connection must not hold up shutdown.
    let client = harness::cleartext_client(false);
    let resp = client
        .get(format!("http://{}/healthz", info.host_port()))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let deadline = Instant::now() + Duration::from_secs(5);
    tokio::time::timeout(Duration::from_secs(6), t.mux.shutdown(deadline))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn endpoints_feed_hot_restart() {
    let first = TestMux::spawn(3).await;
    let a = first.mux.init_listener("a").await.unwrap();
    let b = first.mux.init_listener("b").await.unwrap();
    let saved = first.mux.endpoints().await;
    first.shutdown().await;
    assert_eq!(saved, vec![endpoint("a", a.port), endpoint("b", b.port)]);

    // A new process on the same host takes over the saved endpoints.
    let second = TestMux::spawn(3).await;
    assert_eq!(second.mux.hot_restart(&saved).await.unwrap(), 2);

    let listed = second.mux.list_listeners().await;
    assert_eq!(listed["a"], a.address());
    assert_eq!(listed["b"], b.address());

    second.shutdown().await;
}
