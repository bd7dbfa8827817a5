use std::sync::Arc;
use std::time::Duration;

use rulestream_core::{Fact, Hit};
use rulestream_db_memory::{InMemoryFactStore, InMemorySearchBackend};
use rulestream_server::config::SearchBackendConfig;
use rulestream_server::{AppConfig, ServerBuilder};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

struct TestServer {
    base: String,
    client: reqwest::Client,
    search: Arc<InMemorySearchBackend>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start(search: InMemorySearchBackend, tune: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut cfg = AppConfig::default();
        cfg.exports.export_path = dir.path().join("exports");
        cfg.exports.batch_size = 2;
        cfg.search_backends
            .insert("main".into(), SearchBackendConfig { export_activated: true });
        cfg.search_backends
            .insert("archive".into(), SearchBackendConfig { export_activated: false });
        tune(&mut cfg);

        let facts = InMemoryFactStore::with_facts([
            Fact::new(1, "door events", json!({})),
            Fact::new(2, "alarms", json!({})),
        ]);
        let search = Arc::new(search);
        let server = ServerBuilder::new()
            .with_config(cfg)
            .with_backends(Arc::new(facts), search.clone())
            .build()
            .await
            .expect("build server");

        // Bind to an ephemeral port
        let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind");
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = server
                .serve(listener, async move {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            search,
            shutdown: Some(tx),
            handle: Some(handle),
            _dir: dir,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str, user: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base))
            .header("x-user-id", user)
            .header("x-user-permissions", "*")
    }

    async fn wait_for_status(&self, id: &str, user: &str, status: &str) -> Value {
        for _ in 0..300 {
            let resp = self
                .request(reqwest::Method::GET, &format!("/engine/exports/{id}"), user)
                .send()
                .await
                .unwrap();
            if resp.status() == 200 {
                let job: Value = resp.json().await.unwrap();
                if job["status"] == status {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("export {id} never reached {status}");
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn rows(prefix: &str, n: usize) -> Vec<Hit> {
    (0..n)
        .map(|i| {
            json!({"site": format!("{prefix}{i}"), "tags": ["a", "b"]})
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect()
}

fn seeded_backend() -> InMemorySearchBackend {
    let backend = InMemorySearchBackend::new();
    backend.set_fact_hits(1, rows("p", 3));
    backend.set_fact_hits(2, rows("q", 2));
    backend.set_index_hits("events-*", rows("e", 2));
    backend
}

#[tokio::test]
async fn streamed_export_returns_rows_in_fact_order() {
    let server = TestServer::start(seeded_backend(), |_| {}).await;

    let resp = server
        .request(reqwest::Method::POST, "/engine/facts/streamedexport", "u1")
        .json(&json!({
            "factIDs": [1, 2],
            "title": "T",
            "csvParameters": {"separator": ",", "listSeparator": ";"}
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/octet-stream");
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    assert!(
        resp.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .starts_with("attachment")
    );
    assert!(resp.headers().contains_key("x-request-id"));

    let body = resp.text().await.unwrap();
    assert_eq!(body, "site,tags\np0,a;b\np1,a;b\np2,a;b\nq0,a;b\nq1,a;b\n");

    server.stop().await;
}

#[tokio::test]
async fn backend_failure_after_first_chunk_truncates_body() {
    let backend = InMemorySearchBackend::new().with_page_delay(Duration::from_millis(20));
    backend.set_fact_hits(1, rows("p", 3));
    backend.fail_on("fact:2", "index closed");
    let server = TestServer::start(backend, |_| {}).await;

    let mut resp = server
        .request(reqwest::Method::POST, "/engine/facts/streamedexport", "u1")
        .json(&json!({"factIDs": [1, 2], "title": "T"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut received = Vec::new();
    let outcome = loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => received.extend_from_slice(&chunk),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    assert!(outcome.is_err(), "body must end in a transfer error");
    let received = String::from_utf8(received).unwrap();
    assert!(
        "site,tags\np0,a;b\np1,a;b\np2,a;b\n".starts_with(&received),
        "unexpected partial body {received:?}"
    );

    server.stop().await;
}

#[tokio::test]
async fn client_disconnect_stops_streamed_export() {
    let backend = InMemorySearchBackend::new().with_page_delay(Duration::from_millis(20));
    backend.set_fact_hits(1, rows("p", 400));
    let server = TestServer::start(backend, |_| {}).await;

    let mut resp = server
        .request(reqwest::Method::POST, "/engine/facts/streamedexport", "u1")
        .json(&json!({"factIDs": [1], "title": "T"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let first = resp.chunk().await.unwrap().expect("first chunk");
    assert!(first.starts_with(b"site,tags\n"));
    drop(resp);

    // Let the server notice the closed connection, then check fetching stopped
    tokio::time::sleep(Duration::from_millis(500)).await;
    let settled = server.search.fetch_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.search.fetch_count(), settled);
    assert!(settled < 200, "producer kept paging after disconnect: {settled} fetches");

    server.stop().await;
}

#[tokio::test]
async fn separator_conflict_is_rejected_before_processing() {
    let server = TestServer::start(seeded_backend(), |_| {}).await;

    let resp = server
        .request(reqwest::Method::POST, "/engine/facts/streamedexport", "u1")
        .json(&json!({
            "factIDs": [1],
            "title": "T",
            "csvParameters": {"separator": ",", "listSeparator": ","}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "export.separator_conflict");
    assert_eq!(server.search.fetch_count(), 0);

    let resp = server
        .request(reqwest::Method::POST, "/engine/facts/streamedexport", "u1")
        .json(&json!({"factIDs": [], "title": "T"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .request(reqwest::Method::POST, "/engine/facts/streamedexport", "u1")
        .json(&json!({"factIDs": [99], "title": "T"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "export.no_fact_found");

    server.stop().await;
}

#[tokio::test]
async fn identical_requests_share_one_job() {
    let server = TestServer::start(seeded_backend(), |_| {}).await;
    let body = json!({"factIDs": [2, 1], "title": "Shared"});

    let (first, second) = tokio::join!(
        server
            .request(reqwest::Method::POST, "/engine/exports/fact", "alice")
            .json(&body)
            .send(),
        server
            .request(reqwest::Method::POST, "/engine/exports/fact", "bob")
            .json(&body)
            .send(),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    let mut statuses = vec![first.status().as_u16(), second.status().as_u16()];
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 201]);

    let first: Value = first.json().await.unwrap();
    let second: Value = second.json().await.unwrap();
    assert_eq!(first["id"], second["id"]);
    let id = first["id"].as_str().unwrap().to_string();

    for user in ["alice", "bob"] {
        let list: Value = server
            .request(reqwest::Method::GET, "/engine/exports", user)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let ids: Vec<&str> = list
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|job| job["id"].as_str())
            .collect();
        assert_eq!(ids, vec![id.as_str()]);
    }

    // Same user again is a conflict
    let resp = server
        .request(reqwest::Method::POST, "/engine/exports/fact", "alice")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let job = server.wait_for_status(&id, "alice", "completed").await;
    assert_eq!(job["progress"], 1.0);
    assert_eq!(job["subscriberCount"], 2);
    assert!(job.get("users").is_none());

    let resp = server
        .request(reqwest::Method::GET, &format!("/engine/exports/{id}/download"), "bob")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.text().await.unwrap(),
        "site,tags\nq0,a;b\nq1,a;b\np0,a;b\np1,a;b\np2,a;b\n"
    );

    // Other tenants cannot see it
    let resp = server
        .request(reqwest::Method::GET, &format!("/engine/exports/{id}"), "mallory")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn delete_while_running_cancels_the_job() {
    let backend = InMemorySearchBackend::new().with_page_delay(Duration::from_millis(50));
    backend.set_fact_hits(1, rows("p", 40));
    backend.set_fact_hits(2, rows("q", 40));
    let server = TestServer::start(backend, |cfg| {
        cfg.exports.queue_capacity = 1;
        cfg.exports.batch_size = 1;
    })
    .await;

    let resp = server
        .request(reqwest::Method::POST, "/engine/exports/fact", "u1")
        .json(&json!({"factIDs": [1], "title": "Slow"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let job: Value = resp.json().await.unwrap();
    let id = job["id"].as_str().unwrap().to_string();
    assert_eq!(job["status"], "pending");

    server.wait_for_status(&id, "u1", "running").await;

    // Capacity is exhausted by the running job
    let resp = server
        .request(reqwest::Method::POST, "/engine/exports/fact", "u1")
        .json(&json!({"factIDs": [2], "title": "Other"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    assert!(!resp.headers().contains_key("retry-after"));

    let resp = server
        .request(reqwest::Method::DELETE, &format!("/engine/exports/{id}"), "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let job = server.wait_for_status(&id, "u1", "canceled").await;
    assert!(job["fileName"].is_null());

    let resp = server
        .request(reqwest::Method::GET, &format!("/engine/exports/{id}/download"), "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = server
        .request(reqwest::Method::DELETE, &format!("/engine/exports/{id}"), "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let resp = server
        .request(reqwest::Method::GET, &format!("/engine/exports/{id}"), "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn custom_export_requires_activated_backend() {
    let server = TestServer::start(seeded_backend(), |_| {}).await;
    let body = |backend: &str| {
        json!({
            "title": "Raw events",
            "indices": "events-*",
            "searchRequests": [{"query": {"match_all": {}}}],
            "elasticName": backend
        })
    };

    let resp = server
        .request(reqwest::Method::POST, "/engine/exports/custom", "u1")
        .json(&body("archive"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "export.disabled");

    let resp = server
        .request(reqwest::Method::POST, "/engine/exports/custom", "u1")
        .json(&body("unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .request(reqwest::Method::POST, "/engine/exports/custom", "u1")
        .json(&body("main"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let job: Value = resp.json().await.unwrap();
    let id = job["id"].as_str().unwrap().to_string();

    server.wait_for_status(&id, "u1", "completed").await;
    let resp = server
        .request(reqwest::Method::GET, &format!("/engine/exports/{id}/download"), "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "site,tags\ne0,a;b\ne1,a;b\n");

    server.stop().await;
}

#[tokio::test]
async fn identity_and_permissions_are_enforced() {
    let server = TestServer::start(seeded_backend(), |_| {}).await;

    let resp = server
        .client
        .get(format!("{}/engine/exports", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(format!("{}/engine/exports/fact", server.base))
        .header("x-user-id", "u1")
        .header("x-user-permissions", "export.read")
        .json(&json!({"factIDs": [1], "title": "T"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "missing permission");

    let resp = server
        .request(reqwest::Method::GET, "/engine/exports/not-a-uuid", "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .get(format!("{}/healthz", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    server.stop().await;
}
