//! End-to-end routing tests: a real listener in front of the dispatcher,
//! driven over plain HTTP.

use navigator::auth::AuthVerifier;
use navigator::config;
use navigator::dispatch::Dispatcher;
use navigator::hub::Hub;
use navigator::proxy::ProxyEngine;
use navigator::server::{router, ControlEvent, SharedDispatcher};
use navigator::supervisor::WorkerSupervisor;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct TestServer {
    addr: SocketAddr,
    shared: SharedDispatcher,
    client: reqwest::Client,
    _control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    _dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Boot a server on a random port from a YAML snippet. `dir` is available in
/// the template as `{dir}` for filesystem-backed fixtures.
async fn boot(yaml_template: &str) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let yaml = yaml_template.replace("{dir}", dir.path().to_str().unwrap());
    let config_path = dir.path().join("navigator.yml");
    std::fs::write(&config_path, yaml).unwrap();
    let config = Arc::new(config::load(&config_path).unwrap());

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let proxy = Arc::new(ProxyEngine::new().unwrap());
    proxy.apply_config(&config);
    let supervisor = WorkerSupervisor::new(&config);
    let hub = Arc::new(Hub::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&config),
        Arc::new(AuthVerifier::new(config.auth.clone())),
        supervisor,
        proxy,
        hub,
        control_tx,
    ));
    let shared = SharedDispatcher::new(dispatcher);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(shared.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        shared,
        client: reqwest::Client::new(),
        _control_rx: control_rx,
        _dir: dir,
    }
}

#[tokio::test]
async fn unmatched_path_is_404() {
    let srv = boot("listen: \"127.0.0.1:0\"\n").await;
    let resp = srv.client.get(srv.url("/nowhere")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn static_files_resolve_with_try_files_and_index() {
    let srv = boot(
        r#"
listen: "127.0.0.1:0"
static:
  rules:
    - { prefix: /, root: "{dir}/public" }
  try_files: [".html"]
"#,
    )
    .await;
    let public = srv._dir.path().join("public");
    std::fs::create_dir_all(public.join("docs")).unwrap();
    std::fs::write(public.join("about.html"), "<h1>about</h1>").unwrap();
    std::fs::write(public.join("docs/index.html"), "<h1>docs</h1>").unwrap();

    // try_files: /about resolves to about.html.
    let resp = srv.client.get(srv.url("/about")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert_eq!(resp.text().await.unwrap(), "<h1>about</h1>");

    // Directory request resolves to its index.
    let resp = srv.client.get(srv.url("/docs/")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "<h1>docs</h1>");

    // Traversal is refused (404, not the file).
    let resp = srv
        .client
        .get(srv.url("/../navigator.yml"))
        .send()
        .await
        .unwrap();
    assert_ne!(resp.status(), 200);
}

#[tokio::test]
async fn maintenance_gates_dynamic_but_serves_static() {
    let srv = boot(
        r#"
listen: "127.0.0.1:0"
maintenance:
  enabled: true
  page: "{dir}/503.html"
static:
  rules:
    - { prefix: /assets/, root: "{dir}/assets" }
"#,
    )
    .await;
    std::fs::write(srv._dir.path().join("503.html"), "<h1>down</h1>").unwrap();
    std::fs::create_dir_all(srv._dir.path().join("assets")).unwrap();
    std::fs::write(srv._dir.path().join("assets/logo.png"), b"png-bytes").unwrap();

    // Dynamic request: maintenance page with 503.
    let resp = srv.client.get(srv.url("/acme/data")).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), "<h1>down</h1>");

    // Static asset still serves.
    let resp = srv
        .client
        .get(srv.url("/assets/logo.png"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"png-bytes");
}

#[tokio::test]
async fn basic_auth_challenge_and_acceptance() {
    let srv = boot(
        r#"
listen: "127.0.0.1:0"
static:
  rules:
    - { prefix: /, root: "{dir}/public" }
auth:
  htpasswd: "{dir}/htpasswd"
  realm: Fleet
  public_paths: ["/open/*"]
"#,
    )
    .await;
    std::fs::create_dir_all(srv._dir.path().join("public/open")).unwrap();
    std::fs::write(srv._dir.path().join("public/page.html"), "secret").unwrap();
    std::fs::write(srv._dir.path().join("public/open/page.html"), "public").unwrap();
    std::fs::write(srv._dir.path().join("htpasswd"), "alice:s3cret\n").unwrap();

    // No credentials: 401 with a Basic challenge carrying the realm.
    let resp = srv.client.get(srv.url("/page.html")).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let challenge = resp.headers()["www-authenticate"].to_str().unwrap();
    assert!(challenge.starts_with("Basic realm=\"Fleet\""));

    // Wrong password: still 401.
    let resp = srv
        .client
        .get(srv.url("/page.html"))
        .basic_auth("alice", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Correct credentials pass through to the static handler.
    let resp = srv
        .client
        .get(srv.url("/page.html"))
        .basic_auth("alice", Some("s3cret"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "secret");

    // Public paths skip authentication entirely.
    let resp = srv
        .client
        .get(srv.url("/open/page.html"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn broadcast_endpoint_validates_input() {
    let srv = boot("listen: \"127.0.0.1:0\"\n").await;

    // Non-POST: 405.
    let resp = srv.client.get(srv.url("/_broadcast")).send().await.unwrap();
    assert_eq!(resp.status(), 405);

    // Malformed JSON: 400.
    let resp = srv
        .client
        .post(srv.url("/_broadcast"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Missing stream: 400.
    let resp = srv
        .client
        .post(srv.url("/_broadcast"))
        .body(r#"{"data": 1}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Valid payload with no subscribers: still 200.
    let resp = srv
        .client
        .post(srv.url("/_broadcast"))
        .body(r#"{"stream":"room1","data":{"m":"hi"}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["delivered"], 0);
}

#[tokio::test]
async fn cgi_scripts_execute_in_the_chain() {
    let srv = boot(
        r#"
listen: "127.0.0.1:0"
cgi:
  - path: /cgi-bin/hello
    script: "{dir}/hello.sh"
    methods: [GET]
"#,
    )
    .await;
    let script = srv._dir.path().join("hello.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\n\\nhello %s' \"$REQUEST_METHOD\"\n",
    )
    .unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let resp = srv
        .client
        .get(srv.url("/cgi-bin/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hello GET");

    // Method outside the rule falls through to 404.
    let resp = srv
        .client
        .post(srv.url("/cgi-bin/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn dispatcher_swap_is_observed_by_new_requests_only() {
    let srv = boot("listen: \"127.0.0.1:0\"\n").await;

    // Pre-swap: 404 everywhere.
    let resp = srv.client.get(srv.url("/anything")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    // Swap in a maintenance-mode snapshot the way a reload would.
    let yaml = format!(
        "listen: \"127.0.0.1:0\"\nmaintenance:\n  enabled: true\n  page: \"{}/503.html\"\n",
        srv._dir.path().display()
    );
    std::fs::write(srv._dir.path().join("503.html"), "down").unwrap();
    let config_path = srv._dir.path().join("navigator2.yml");
    std::fs::write(&config_path, yaml).unwrap();
    let new_config = Arc::new(config::load(&config_path).unwrap());

    let (tx, _rx) = mpsc::unbounded_channel();
    let proxy = Arc::new(ProxyEngine::new().unwrap());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&new_config),
        Arc::new(AuthVerifier::new(None)),
        WorkerSupervisor::new(&new_config),
        proxy,
        Arc::new(Hub::new()),
        tx,
    ));
    srv.shared.swap(dispatcher);

    let resp = srv.client.get(srv.url("/anything")).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), "down");
}
