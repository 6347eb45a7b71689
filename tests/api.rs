//! End-to-end tests of the HTTP API.
//!
//! Each test starts the real router on `127.0.0.1:0` with in-memory adapters
//! and talks to it with `reqwest`.

use async_trait::async_trait;
use axum::body::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use kbchat::config::Config;
use kbchat::error::{GatewayError, GatewayResult};
use kbchat::models::{AgentRun, AgentRunStatus, BlobInfo, RetrievedDocument, ThreadMessage};
use kbchat::server::{build_router, AppState};
use kbchat::traits::{
    AgentService, BlobDownload, BlobStore, ChatModel, DocumentSearch, ModelReply, Services,
};

// ============ Harness ============

fn config(vars: &[(&str, &str)]) -> Config {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|k| map.get(k).cloned()).unwrap()
}

async fn spawn(config: Config, services: Services) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState::new(config, services));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ============ Fakes ============

struct FakeModel {
    seen: Mutex<Vec<Value>>,
    status: u16,
    body: Value,
}

impl FakeModel {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            status: 200,
            body: json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "[No KB] Hello!"}}]
            }),
        })
    }
}

#[async_trait]
impl ChatModel for FakeModel {
    async fn complete(&self, messages: &[Value], _max_tokens: u32) -> GatewayResult<ModelReply> {
        *self.seen.lock().unwrap() = messages.to_vec();
        Ok(ModelReply {
            status: self.status,
            body: self.body.clone(),
        })
    }
}

struct FakeSearch(Vec<&'static str>);

#[async_trait]
impl DocumentSearch for FakeSearch {
    async fn ordered_documents(
        &self,
        _query: &str,
        limit: usize,
    ) -> GatewayResult<Vec<RetrievedDocument>> {
        Ok(self
            .0
            .iter()
            .take(limit)
            .filter_map(|c| RetrievedDocument::from_value(json!({ "content": c })))
            .collect())
    }
}

#[derive(Default)]
struct MemoryBlobs {
    blobs: Mutex<BTreeMap<String, (String, Vec<u8>)>>,
    last_limit: Mutex<Option<usize>>,
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    fn container(&self) -> &str {
        "uploads"
    }

    async fn put(&self, name: &str, content_type: &str, data: Vec<u8>) -> GatewayResult<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert(name.to_string(), (content_type.to_string(), data));
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> GatewayResult<Vec<BlobInfo>> {
        *self.last_limit.lock().unwrap() = Some(limit);
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .take(limit)
            .map(|(name, (ct, data))| BlobInfo {
                name: name.clone(),
                size: data.len() as u64,
                content_type: Some(ct.clone()),
                last_modified: None,
            })
            .collect())
    }

    async fn open(&self, name: &str) -> GatewayResult<BlobDownload> {
        let Some((ct, data)) = self.blobs.lock().unwrap().get(name).cloned() else {
            return Err(GatewayError::NotFound(format!("blob '{}'", name)));
        };
        let len = data.len() as u64;
        Ok(BlobDownload {
            content_type: Some(ct),
            content_length: Some(len),
            body: futures::stream::iter(vec![Ok(Bytes::from(data))]).boxed(),
        })
    }
}

struct FakeAgent {
    statuses: Mutex<VecDeque<&'static str>>,
    last_error: Option<Value>,
    cancelled: Mutex<bool>,
}

impl FakeAgent {
    fn new(statuses: &[&'static str]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            last_error: None,
            cancelled: Mutex::new(false),
        }
    }

    fn next_run(&self) -> AgentRun {
        let mut statuses = self.statuses.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.pop_front().unwrap()
        } else {
            statuses.front().copied().unwrap()
        };
        AgentRun {
            id: "run_1".into(),
            status: AgentRunStatus::parse(status),
            last_error: self.last_error.clone(),
        }
    }
}

#[async_trait]
impl AgentService for FakeAgent {
    async fn create_thread(&self) -> GatewayResult<String> {
        Ok("thread_1".into())
    }

    async fn add_user_message(&self, _thread_id: &str, _content: &str) -> GatewayResult<()> {
        Ok(())
    }

    async fn create_run(&self, _thread_id: &str) -> GatewayResult<AgentRun> {
        Ok(self.next_run())
    }

    async fn get_run(&self, _thread_id: &str, _run_id: &str) -> GatewayResult<AgentRun> {
        Ok(self.next_run())
    }

    async fn cancel_run(&self, _thread_id: &str, _run_id: &str) -> GatewayResult<()> {
        *self.cancelled.lock().unwrap() = true;
        Ok(())
    }

    async fn list_messages(&self, _thread_id: &str) -> GatewayResult<Vec<ThreadMessage>> {
        Ok(serde_json::from_value(json!([
            {"role": "user", "content": [{"type": "text", "text": {"value": "summarize"}}]},
            {"role": "assistant", "content": [
                {"type": "image_file", "image_file": {"file_id": "f1"}},
                {"type": "text", "text": {"value": "Here is the summary."}}
            ]}
        ]))
        .unwrap())
    }
}

const FAST_POLL: [(&str, &str); 2] = [
    ("AGENT_POLL_INTERVAL_MS", "5"),
    ("AGENT_POLL_MAX_INTERVAL_MS", "10"),
];

// ============ Health ============

#[tokio::test]
async fn health_reports_capabilities_without_secrets() {
    let cfg = config(&[
        ("AZURE_OPENAI_ENDPOINT", "https://example.openai.azure.com/x"),
        ("AZURE_OPENAI_API_KEY", "super-secret-key"),
    ]);
    let base = spawn(cfg, Services::default()).await;

    let resp = reqwest::get(format!("{}/api/health", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(!text.contains("super-secret-key"));

    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["endpointConfigured"], true);
    assert_eq!(body["keyConfigured"], true);
    assert_eq!(body["blobConfigured"], false);
    assert_eq!(body["searchConfigured"], false);
    assert_eq!(body["agentConfigured"], false);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

// ============ Chat ============

#[tokio::test]
async fn chat_rejects_non_array_messages() {
    let base = spawn(config(&[]), Services::default()).await;
    let client = reqwest::Client::new();

    for body in [json!({"messages": "hello"}), json!({}), json!([1, 2])] {
        let resp = client
            .post(format!("{}/api/chat", base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let err: Value = resp.json().await.unwrap();
        assert_eq!(err["error"]["code"], "bad_request");
        assert_eq!(err["error"]["message"], "messages must be an array");
    }

    let resp = client
        .post(format!("{}/api/chat", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn chat_without_model_is_not_configured() {
    let base = spawn(config(&[]), Services::default()).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({"messages": [{"role": "user", "content": "hello"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "not_configured");
    assert_eq!(err["error"]["message"], "Missing Azure OpenAI configuration");
}

#[tokio::test]
async fn chat_hello_without_search() {
    let model = FakeModel::ok();
    let services = Services {
        model: Some(model.clone()),
        ..Default::default()
    };
    let base = spawn(config(&[]), services).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({"messages": [{"role": "user", "content": "hello"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-knowledge-base-used"], "false");
    assert_eq!(resp.headers()["x-knowledge-base-doc-count"], "0");

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["meta"], json!({"kbUsed": false, "kbDocCount": 0}));
    assert_eq!(body["choices"][0]["message"]["content"], "[No KB] Hello!");

    let seen = model.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0]["role"], "system");
    assert_eq!(seen[1], json!({"role": "user", "content": "hello"}));
}

#[tokio::test]
async fn chat_with_search_injects_context() {
    let model = FakeModel::ok();
    let services = Services {
        model: Some(model.clone()),
        search: Some(Arc::new(FakeSearch(vec!["Refunds take 5 days.", "Ship on Mondays."]))),
        ..Default::default()
    };
    let base = spawn(config(&[]), services).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({"messages": [{"role": "user", "content": "refund policy?"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-knowledge-base-used"], "true");
    assert_eq!(resp.headers()["x-knowledge-base-doc-count"], "2");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["meta"]["kbDocCount"], 2);

    let seen = model.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert_eq!(
        seen[1]["content"],
        "Context:\nDoc 1: Refunds take 5 days.\n\nDoc 2: Ship on Mondays."
    );
}

#[tokio::test]
async fn chat_passes_upstream_errors_through() {
    let model = Arc::new(FakeModel {
        seen: Mutex::new(Vec::new()),
        status: 429,
        body: json!({"error": {"code": "429", "message": "Too many requests"}}),
    });
    let services = Services {
        model: Some(model),
        ..Default::default()
    };
    let base = spawn(config(&[]), services).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .json(&json!({"messages": [{"role": "user", "content": "hello"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    assert!(resp.headers().get("x-knowledge-base-used").is_none());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({"error": {"code": "429", "message": "Too many requests"}})
    );
}

// ============ Blobs ============

#[tokio::test]
async fn upload_list_and_download() {
    let store = Arc::new(MemoryBlobs::default());
    let services = Services {
        blobs: Some(store.clone()),
        ..Default::default()
    };
    let base = spawn(config(&[]), services).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new()
        .part(
            "files",
            reqwest::multipart::Part::bytes(b"alpha".to_vec())
                .file_name("notes.txt")
                .mime_str("text/plain")
                .unwrap(),
        )
        .part(
            "files",
            reqwest::multipart::Part::bytes(b"beta".to_vec()).file_name("notes.txt"),
        )
        .text("comment", "ignored");

    let resp = client
        .post(format!("{}/api/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["uploaded"], 2);
    let names: Vec<String> = body["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.iter().all(|n| n.ends_with("-notes.txt")));
    assert_ne!(names[0], names[1]);

    let resp = client
        .get(format!("{}/api/blobs", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let listing: Value = resp.json().await.unwrap();
    assert_eq!(listing["container"], "uploads");
    assert_eq!(listing["prefix"], "");
    assert_eq!(listing["count"], 2);
    assert_eq!(*store.last_limit.lock().unwrap(), Some(100));

    let resp = client
        .get(format!("{}/api/blobs/{}", base, names[0]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let ct = resp.headers()["content-type"].to_str().unwrap().to_string();
    let bytes = resp.bytes().await.unwrap();
    let (expected_ct, expected) = store.blobs.lock().unwrap()[&names[0]].clone();
    assert_eq!(ct, expected_ct);
    assert_eq!(bytes.as_ref(), expected.as_slice());
}

#[tokio::test]
async fn upload_without_files_is_empty() {
    let services = Services {
        blobs: Some(Arc::new(MemoryBlobs::default())),
        ..Default::default()
    };
    let base = spawn(config(&[]), services).await;

    let form = reqwest::multipart::Form::new().text("other", "x");
    let resp = reqwest::Client::new()
        .post(format!("{}/api/upload", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"uploaded": 0, "files": []}));
}

#[tokio::test]
async fn download_missing_blob_is_404() {
    let services = Services {
        blobs: Some(Arc::new(MemoryBlobs::default())),
        ..Default::default()
    };
    let base = spawn(config(&[]), services).await;

    let resp = reqwest::get(format!("{}/api/blobs/reports/2026/missing.pdf", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "not_found");
}

#[tokio::test]
async fn download_keeps_slashes_in_name() {
    let store = Arc::new(MemoryBlobs::default());
    store
        .put("reports/2026/q3.csv", "text/csv", b"a,b\n".to_vec())
        .await
        .unwrap();
    let services = Services {
        blobs: Some(store),
        ..Default::default()
    };
    let base = spawn(config(&[]), services).await;

    let resp = reqwest::get(format!("{}/api/blobs/reports/2026/q3.csv", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/csv");
    assert_eq!(resp.text().await.unwrap(), "a,b\n");
}

#[tokio::test]
async fn list_limit_is_clamped() {
    let store = Arc::new(MemoryBlobs::default());
    let services = Services {
        blobs: Some(store.clone()),
        ..Default::default()
    };
    let base = spawn(config(&[]), services).await;

    for (query, expected) in [("limit=50000", 1000), ("limit=abc", 100), ("limit=7", 7)] {
        let resp = reqwest::get(format!("{}/api/blobs?prefix=r&{}", base, query))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let listing: Value = resp.json().await.unwrap();
        assert_eq!(listing["prefix"], "r");
        assert_eq!(*store.last_limit.lock().unwrap(), Some(expected));
    }
}

#[tokio::test]
async fn blob_endpoints_require_storage() {
    let base = spawn(config(&[]), Services::default()).await;
    let client = reqwest::Client::new();

    let list = client.get(format!("{}/api/blobs", base)).send().await.unwrap();
    let download = client
        .get(format!("{}/api/blobs/a.txt", base))
        .send()
        .await
        .unwrap();
    let upload = client
        .post(format!("{}/api/upload", base))
        .multipart(reqwest::multipart::Form::new().text("files", "x"))
        .send()
        .await
        .unwrap();

    for resp in [list, download, upload] {
        assert_eq!(resp.status(), 500);
        let err: Value = resp.json().await.unwrap();
        assert_eq!(err["error"]["code"], "not_configured");
        assert_eq!(err["error"]["message"], "Blob storage is not configured");
    }
}

// ============ Agent ============

#[tokio::test]
async fn agent_returns_text_transcript() {
    let services = Services {
        agent: Some(Arc::new(FakeAgent::new(&["queued", "in_progress", "completed"]))),
        ..Default::default()
    };
    let base = spawn(config(&FAST_POLL), services).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/agent", base))
        .json(&json!({"message": "summarize"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "status": "completed",
            "messages": [
                {"role": "user", "text": "summarize"},
                {"role": "assistant", "text": "Here is the summary."}
            ]
        })
    );
}

#[tokio::test]
async fn agent_requires_prompt_before_configuration() {
    let base = spawn(config(&[]), Services::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/agent", base))
        .json(&json!({"prompt": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["message"], "prompt is required");

    let resp = client
        .post(format!("{}/api/agent", base))
        .json(&json!({"prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "not_configured");
}

#[tokio::test]
async fn failed_agent_run_carries_detail() {
    let mut agent = FakeAgent::new(&["queued", "failed"]);
    agent.last_error = Some(json!({"code": "rate_limit_exceeded", "message": "slow down"}));
    let services = Services {
        agent: Some(Arc::new(agent)),
        ..Default::default()
    };
    let base = spawn(config(&FAST_POLL), services).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/agent", base))
        .json(&json!({"prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "agent_run_failed");
    assert_eq!(err["error"]["detail"]["code"], "rate_limit_exceeded");
}

#[tokio::test]
async fn stuck_agent_run_times_out() {
    let agent = Arc::new(FakeAgent::new(&["in_progress"]));
    let services = Services {
        agent: Some(agent.clone()),
        ..Default::default()
    };
    let mut vars = FAST_POLL.to_vec();
    vars.push(("AGENT_RUN_TIMEOUT_SECS", "1"));
    let base = spawn(config(&vars), services).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/agent", base))
        .json(&json!({"text": "never finishes"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "timeout");
    assert!(*agent.cancelled.lock().unwrap());
}

// ============ Static files ============

#[tokio::test]
async fn static_files_are_served_as_fallback() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>kbchat</h1>").unwrap();
    let static_dir = dir.path().to_string_lossy().to_string();
    let base = spawn(config(&[("STATIC_DIR", &static_dir)]), Services::default()).await;

    let resp = reqwest::get(format!("{}/", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "<h1>kbchat</h1>");

    let resp = reqwest::get(format!("{}/missing.js", base)).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn dotfiles_in_static_dir_are_not_served() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>kbchat</h1>").unwrap();
    std::fs::write(
        dir.path().join(".env"),
        "AZURE_OPENAI_API_KEY=sk-live-secret\n",
    )
    .unwrap();
    std::fs::create_dir(dir.path().join(".git")).unwrap();
    std::fs::write(
        dir.path().join(".git").join("config"),
        "[remote \"origin\"]\n\turl = https://token@example.com/repo.git\n",
    )
    .unwrap();
    let static_dir = dir.path().to_string_lossy().to_string();
    let base = spawn(config(&[("STATIC_DIR", &static_dir)]), Services::default()).await;

    for path in ["/.env", "/.git/config", "/.git/"] {
        let resp = reqwest::get(format!("{}{}", base, path)).await.unwrap();
        assert_eq!(resp.status(), 404, "{}", path);
        let body = resp.text().await.unwrap();
        assert!(!body.contains("sk-live-secret"), "{}", path);
        assert!(!body.contains("token@"), "{}", path);
    }

    let resp = reqwest::get(format!("{}/index.html", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn cors_exposes_knowledge_base_headers() {
    let services = Services {
        model: Some(FakeModel::ok()),
        search: Some(Arc::new(FakeSearch(vec!["Refunds take 5 days."]))),
        ..Default::default()
    };
    let base = spawn(config(&[]), services).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", base))
        .header("origin", "https://app.example.com")
        .json(&json!({"messages": [{"role": "user", "content": "refund policy?"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    let exposed = resp.headers()["access-control-expose-headers"]
        .to_str()
        .unwrap()
        .to_ascii_lowercase();
    assert!(exposed.contains("x-knowledge-base-used"));
    assert!(exposed.contains("x-knowledge-base-doc-count"));
}
