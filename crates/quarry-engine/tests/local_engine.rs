//! End-to-end tests of `LocalEngine` nodes over their real listeners.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use quarry_engine::{Client, Engine, EngineError, EngineNode, LocalEngine, TransportClient};
use quarry_types::{ClusterIdentity, HealthState, Query, SearchRequest, Settings, keys};
use test_case::test_case;

fn settings(cluster: &str) -> Settings {
    Settings::builder()
        .put(keys::CLUSTER_NAME, cluster)
        .put(keys::NUMBER_OF_SHARDS, 2)
        .put(keys::NUMBER_OF_REPLICAS, 1)
        .build()
}

fn start_nodes(
    engine: &LocalEngine,
    identity: &ClusterIdentity,
    count: usize,
) -> Vec<Arc<dyn EngineNode>> {
    (0..count)
        .map(|ordinal| {
            engine
                .start(identity, ordinal, settings(identity.name()))
                .unwrap()
        })
        .collect()
}

fn raw_http(node: &dyn EngineNode, request: &str) -> String {
    let mut stream = TcpStream::connect(node.http_address().unwrap()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn nodes_report_bound_ports_in_settings() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("ports", dir.path());
    let engine = LocalEngine::new();
    let nodes = start_nodes(&engine, &identity, 2);

    for node in &nodes {
        let port: u16 = node
            .settings()
            .get_as(keys::TRANSPORT_PORT)
            .unwrap()
            .unwrap();
        assert_eq!(port, node.transport_address().port());
        assert_ne!(port, 0);
    }
    assert_ne!(nodes[0].transport_address(), nodes[1].transport_address());
    assert!(dir.path().join("node_1").is_dir());
    assert!(dir.path().join("node_2").is_dir());
}

#[test]
fn closing_a_node_fails_over_and_rejects_its_client() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("failover", dir.path());
    let engine = LocalEngine::new();
    let nodes = start_nodes(&engine, &identity, 3);

    let state = nodes[1].client().cluster_state().unwrap();
    assert_eq!(state.master_node.as_deref(), Some("Node 1"));

    let client = nodes[0].client();
    nodes[0].close().unwrap();
    nodes[0].close().unwrap();
    assert!(nodes[0].is_closed());
    assert!(matches!(
        client.cluster_health(None),
        Err(EngineError::NodeClosed(_))
    ));

    let state = nodes[1].client().cluster_state().unwrap();
    assert_eq!(state.master_node.as_deref(), Some("Node 2"));
    assert_eq!(state.running_nodes().count(), 2);
}

#[test]
fn restarted_slot_gets_a_new_instance() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("restart", dir.path());
    let engine = LocalEngine::new();
    let first = engine.start(&identity, 0, settings("restart")).unwrap();
    let old_id = first.instance_id();
    first.close().unwrap();

    let second = engine.start(&identity, 0, settings("restart")).unwrap();
    assert_ne!(second.instance_id(), old_id);
    assert!(!second.is_closed());
    assert_eq!(
        second.client().cluster_state().unwrap().master_node.as_deref(),
        Some("Node 1")
    );
}

#[test]
fn replicas_need_a_second_data_node_for_green() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("health", dir.path());
    let engine = LocalEngine::new();
    let one = engine.start(&identity, 0, settings("health")).unwrap();
    let client = one.client();
    client.create_index("logs", &Settings::default()).unwrap();
    assert_eq!(
        client.cluster_health(Some("logs")).unwrap().status,
        HealthState::Yellow
    );

    let _two = engine.start(&identity, 1, settings("health")).unwrap();
    let health = client.cluster_health(Some("logs")).unwrap();
    assert_eq!(health.status, HealthState::Green);
    assert_eq!(health.active_shards, 4);
}

// ============================================================================
// Transport
// ============================================================================

#[test]
fn transport_client_round_trips_documents() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("transport", dir.path());
    let engine = LocalEngine::new();
    let nodes = start_nodes(&engine, &identity, 2);

    let client = TransportClient::connect(nodes[1].transport_address(), "transport").unwrap();
    assert_eq!(client.node_name(), "Node 2");

    let indexed = client
        .index("docs", "doc", Some("1"), r#"{"msg":"hello world"}"#)
        .unwrap();
    assert!(indexed.created);
    client.refresh(None).unwrap();

    let response = client
        .search(&SearchRequest::new("docs").query(Query::query_string("msg:hello")))
        .unwrap();
    assert_eq!(response.total_hits, 1);
    assert_eq!(response.hits[0].id, "1");
    assert_eq!(client.count(None, None, &Query::MatchAll).unwrap(), 1);

    assert!(matches!(
        client.create_index("docs", &Settings::default()),
        Err(EngineError::IndexAlreadyExists(index)) if index == "docs"
    ));
}

#[test]
fn transport_handshake_rejects_other_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("mine", dir.path());
    let engine = LocalEngine::new();
    let node = engine.start(&identity, 0, settings("mine")).unwrap();

    let err = TransportClient::connect(node.transport_address(), "theirs").unwrap_err();
    assert!(matches!(
        err,
        EngineError::ClusterNameMismatch { expected, actual } if expected == "mine" && actual == "theirs"
    ));
}

// ============================================================================
// HTTP
// ============================================================================

#[test]
fn http_root_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("http-health", dir.path());
    let engine = LocalEngine::new();
    let node = engine.start(&identity, 0, settings("http-health")).unwrap();

    let root = raw_http(node.as_ref(), "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(root.starts_with("HTTP/1.1 200 OK"));
    assert!(root.contains("\"cluster_name\":\"http-health\""));

    let health = raw_http(
        node.as_ref(),
        "GET /_cluster/health HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    assert!(health.contains("\"status\":\"green\""));
}

#[test]
fn http_document_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("http-docs", dir.path());
    let engine = LocalEngine::new();
    let node = engine.start(&identity, 0, settings("http-docs")).unwrap();

    let body = r#"{"msg":"hi"}"#;
    let put = raw_http(
        node.as_ref(),
        &format!(
            "PUT /idx/doc/7 HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ),
    );
    assert!(put.starts_with("HTTP/1.1 201 Created"));
    assert!(put.contains("\"created\":true"));

    let refresh = raw_http(node.as_ref(), "POST /_refresh HTTP/1.1\r\n\r\n");
    assert!(refresh.starts_with("HTTP/1.1 200 OK"));

    let search = raw_http(node.as_ref(), "GET /_search?q=*:* HTTP/1.1\r\n\r\n");
    assert!(search.contains("\"timed_out\":false"));
    assert!(search.contains("\"total\":1"));

    let delete = raw_http(node.as_ref(), "DELETE /idx/doc/7 HTTP/1.1\r\n\r\n");
    assert!(delete.contains("\"found\":true"));

    let missing = raw_http(node.as_ref(), "HEAD /nope HTTP/1.1\r\n\r\n");
    assert!(missing.starts_with("HTTP/1.1 404 Not Found"));
}

#[test_case("GET /idx/doc/1", 200; "get existing document")]
#[test_case("GET /idx/doc/2", 404; "get missing document")]
#[test_case("DELETE /idx/doc/2", 404; "delete missing document")]
#[test_case("HEAD /idx", 200; "head existing index")]
#[test_case("GET /idx/doc/_search", 200; "typed search")]
#[test_case("GET /idx/_count", 200; "index count")]
#[test_case("GET /_cluster/health/idx", 200; "index health")]
#[test_case("PATCH /idx", 400; "unknown method")]
fn http_routes_answer_with_status(request_line: &str, status: u16) {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("http-routes", dir.path());
    let engine = LocalEngine::new();
    let node = engine.start(&identity, 0, settings("http-routes")).unwrap();
    let client = node.client();
    client.create_index("idx", &Settings::default()).unwrap();
    client.index("idx", "doc", Some("1"), r#"{"msg":"hi"}"#).unwrap();
    client.refresh(None).unwrap();

    let response = raw_http(node.as_ref(), &format!("{request_line} HTTP/1.1\r\n\r\n"));
    assert!(
        response.starts_with(&format!("HTTP/1.1 {status} ")),
        "{request_line}: {response}"
    );
}

#[test]
fn http_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let identity = ClusterIdentity::new("no-http", dir.path());
    let engine = LocalEngine::new();
    let settings = settings("no-http")
        .to_builder()
        .put(keys::HTTP_ENABLED, false)
        .build();
    let node = engine.start(&identity, 0, settings).unwrap();
    assert!(node.http_address().is_none());
    assert!(!node.settings().contains(keys::HTTP_PORT));
}
