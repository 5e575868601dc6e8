use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use types::{
    ErrorKind, FunctionDecl, HttpToolConfig, HttpToolSafety, MemoryError, MemoryRecord,
    SafetyTier, Tool, ToolContext, ToolError, ToolsConfig,
};

use super::*;

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn schema(&self) -> FunctionDecl {
        FunctionDecl::new("slow_tool", None, json!({"type": "object"}))
    }

    async fn execute(&self, _args: &str, _context: &ToolContext) -> Result<String, ToolError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok("finished".to_owned())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(20)
    }

    fn safety_tier(&self) -> SafetyTier {
        SafetyTier::ReadOnly
    }
}

struct NamedTool {
    name: &'static str,
    output: String,
}

#[async_trait]
impl Tool for NamedTool {
    fn schema(&self) -> FunctionDecl {
        FunctionDecl::new(
            self.name,
            Some("test tool".to_owned()),
            json!({
                "type": "object",
                "required": ["origin"],
                "properties": {
                    "origin": {"type": "string", "minLength": 3},
                    "passengers": {"type": "integer", "minimum": 1}
                }
            }),
        )
    }

    async fn execute(&self, _args: &str, _context: &ToolContext) -> Result<String, ToolError> {
        Ok(self.output.clone())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn safety_tier(&self) -> SafetyTier {
        SafetyTier::ReadOnly
    }
}

#[derive(Default)]
struct RecordingWriter {
    writes: Mutex<Vec<(String, String, Option<String>)>>,
}

#[async_trait]
impl MemoryWriter for RecordingWriter {
    async fn remember(
        &self,
        principal_id: &str,
        content: &str,
        category: Option<&str>,
    ) -> Result<MemoryRecord, MemoryError> {
        self.writes.lock().expect("writes lock").push((
            principal_id.to_owned(),
            content.to_owned(),
            category.map(str::to_owned),
        ));
        Ok(MemoryRecord {
            record_id: "mem-1".to_owned(),
            owner_id: principal_id.to_owned(),
            content: content.to_owned(),
            embedding: Vec::new(),
            category: category.map(str::to_owned),
            created_at: Utc::now(),
            expires_at: None,
        })
    }
}

struct ThrottledWriter;

#[async_trait]
impl MemoryWriter for ThrottledWriter {
    async fn remember(
        &self,
        _principal_id: &str,
        _content: &str,
        _category: Option<&str>,
    ) -> Result<MemoryRecord, MemoryError> {
        Err(MemoryError::RateLimited {
            retry_after_ms: 4_000,
        })
    }
}

fn context() -> ToolContext {
    ToolContext::new("alice", "session-1")
}

fn named(name: &'static str, output: &str) -> NamedTool {
    NamedTool {
        name,
        output: output.to_owned(),
    }
}

#[test]
fn registry_validates_arguments_against_the_tool_schema() {
    let registry = ToolRegistry::builder()
        .register(named("search_flights", "[]"))
        .build()
        .expect("registry should build");

    registry
        .validate("search_flights", &json!({"origin": "SFO", "passengers": 2}))
        .expect("valid arguments should pass");

    let error = registry
        .validate("search_flights", &json!({"origin": "X"}))
        .expect_err("short origin should fail");
    assert!(matches!(error, ToolError::InvalidArguments { .. }));
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert!(!error.is_retriable());

    let error = registry
        .validate("book_hotel", &json!({}))
        .expect_err("unknown tool should fail");
    assert!(matches!(error, ToolError::UnknownTool { .. }));
}

#[test]
fn registry_rejects_duplicate_and_reserved_names() {
    let duplicate = ToolRegistry::builder()
        .register(named("search_flights", "a"))
        .register(named("search_flights", "b"))
        .build();
    assert!(matches!(
        duplicate,
        Err(RegistryError::DuplicateTool { .. })
    ));

    let reserved = ToolRegistry::builder()
        .register(named(RECALL_MEMORY_TOOL_NAME, "a"))
        .build();
    assert!(matches!(reserved, Err(RegistryError::ReservedName { .. })));
}

#[test]
fn registry_lists_schemas_in_name_order() {
    let registry = ToolRegistry::builder()
        .register(named("search_hotels", "[]"))
        .register(named("book_flight", "ok"))
        .build()
        .expect("registry should build");
    assert_eq!(registry.names(), vec!["book_flight", "search_hotels"]);
    assert_eq!(
        registry
            .schemas()
            .into_iter()
            .map(|decl| decl.name)
            .collect::<Vec<_>>(),
        vec!["book_flight", "search_hotels"]
    );
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn registry_invoke_enforces_timeout_and_truncation() {
    let registry = ToolRegistry::builder()
        .max_output_bytes(8)
        .register(SlowTool)
        .register(named("search_flights", "0123456789abcdef"))
        .build()
        .expect("registry should build");

    let error = registry
        .invoke("slow_tool", &json!({}), &context())
        .await
        .expect_err("slow tool should time out");
    assert!(matches!(
        error,
        ToolError::Timeout {
            timeout_ms: 20,
            ..
        }
    ));

    let output = registry
        .invoke("search_flights", &json!({"origin": "SFO"}), &context())
        .await
        .expect("tool should run");
    assert!(output.starts_with("01234567"));
    assert!(output.contains("output truncated: 16 bytes total"));
}

#[test]
fn truncate_output_respects_char_boundaries() {
    let output = truncate_output("héllo".to_owned(), 2);
    assert!(output.starts_with('h'));
    assert!(!output.starts_with("hé"));
}

#[tokio::test]
async fn memory_write_tool_stores_for_the_calling_principal() {
    let writer = Arc::new(RecordingWriter::default());
    let tool = MemoryWriteTool::new(writer.clone());
    let contract: &dyn Tool = &tool;

    let output = contract
        .execute(
            &json!({"content": "  prefers aisle seats ", "category": "preference"}).to_string(),
            &context(),
        )
        .await
        .expect("memory write should succeed");
    let output: Value = serde_json::from_str(&output).expect("output should be JSON");
    assert_eq!(output["record_id"], "mem-1");
    assert_eq!(output["stored"], true);

    let writes = writer.writes.lock().expect("writes lock");
    assert_eq!(
        writes.as_slice(),
        &[(
            "alice".to_owned(),
            "prefers aisle seats".to_owned(),
            Some("preference".to_owned())
        )]
    );
    assert_eq!(contract.safety_tier(), SafetyTier::SideEffecting);
}

#[tokio::test]
async fn memory_write_tool_rejects_blank_content() {
    let tool = MemoryWriteTool::new(Arc::new(RecordingWriter::default()));
    let error = tool
        .execute(&json!({"content": "   "}).to_string(), &context())
        .await
        .expect_err("blank content should fail");
    assert!(matches!(error, ToolError::InvalidArguments { .. }));
}

#[tokio::test]
async fn memory_write_tool_surfaces_write_budget_denials() {
    let tool = MemoryWriteTool::new(Arc::new(ThrottledWriter));
    let error = tool
        .execute(r#"{"content":"prefers aisle seats"}"#, &context())
        .await
        .expect_err("throttled write should fail");
    assert!(matches!(
        error,
        ToolError::RateLimited { ref tool, retry_after_ms: 4_000 } if tool == MEMORY_WRITE_TOOL_NAME
    ));
    assert_eq!(error.kind(), ErrorKind::RateLimited);
    assert!(!error.is_retriable());
}

#[tokio::test]
async fn http_tool_posts_arguments_with_principal_headers() {
    let seen = Arc::new(Mutex::new(None::<(Value, String)>));
    let captured = seen.clone();
    let app = Router::new().route(
        "/flights",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let captured = captured.clone();
            async move {
                let principal = headers
                    .get("x-wayfarer-principal")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                *captured.lock().expect("capture lock") = Some((body, principal));
                Json(json!({"flights": [{"id": "TP123"}]}))
            }
        }),
    );
    let address = spawn_server(app).await;
    let tool = HttpTool::from_config(&http_config(
        "search_flights",
        &format!("http://{address}/flights"),
        HttpToolSafety::ReadOnly,
    ))
    .expect("tool should build");

    let output = tool
        .execute(&json!({"origin": "SFO"}).to_string(), &context())
        .await
        .expect("request should succeed");
    assert!(output.contains("TP123"));

    let (body, principal) = seen
        .lock()
        .expect("capture lock")
        .clone()
        .expect("request should be captured");
    assert_eq!(body, json!({"origin": "SFO"}));
    assert_eq!(principal, "alice");
    assert_eq!(tool.cache_ttl(), Some(Duration::from_secs(30)));
}

#[tokio::test]
async fn http_tool_maps_status_codes_to_retry_classes() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new()
        .route(
            "/unavailable",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::SERVICE_UNAVAILABLE, "try later")
                }
            }),
        )
        .route(
            "/throttled",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        )
        .route(
            "/bad",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "no such airport") }),
        );
    let address = spawn_server(app).await;

    for (path, retriable) in [("unavailable", true), ("throttled", true), ("bad", false)] {
        let tool = HttpTool::from_config(&http_config(
            "capability",
            &format!("http://{address}/{path}"),
            HttpToolSafety::SideEffecting,
        ))
        .expect("tool should build");
        let error = tool
            .execute("{}", &context())
            .await
            .expect_err("error status should fail");
        assert_eq!(error.is_retriable(), retriable, "path {path}: {error}");
        assert_eq!(tool.cache_ttl(), None);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn http_tool_rejects_non_http_endpoints() {
    let error = match HttpTool::from_config(&http_config(
        "capability",
        "ftp://example.com/x",
        HttpToolSafety::ReadOnly,
    )) {
        Ok(_) => panic!("ftp endpoint should be rejected"),
        Err(error) => error,
    };
    assert!(matches!(error, RegistryError::InvalidEndpoint { .. }));
}

#[test]
fn build_registry_registers_configured_capabilities_and_memory_write() {
    let config = ToolsConfig {
        max_output_bytes: 1024,
        http: vec![
            http_config(
                "search_flights",
                "http://127.0.0.1:9/flights",
                HttpToolSafety::ReadOnly,
            ),
            http_config(
                "book_flight",
                "http://127.0.0.1:9/book",
                HttpToolSafety::Sensitive,
            ),
        ],
    };
    let registry = build_registry(&config, Some(Arc::new(RecordingWriter::default())))
        .expect("registry should build");

    assert_eq!(
        registry.names(),
        vec!["book_flight", MEMORY_WRITE_TOOL_NAME, "search_flights"]
    );
    let booking = registry.get("book_flight").expect("booking tool");
    assert_eq!(booking.safety_tier(), SafetyTier::Sensitive);
    assert_eq!(registry.max_output_bytes(), 1024);

    let without_memory = build_registry(&config, None).expect("registry should build");
    assert!(!without_memory.contains(MEMORY_WRITE_TOOL_NAME));
}

fn http_config(name: &str, endpoint: &str, safety: HttpToolSafety) -> HttpToolConfig {
    HttpToolConfig {
        name: name.to_owned(),
        description: Some(format!("{name} capability")),
        endpoint: endpoint.to_owned(),
        parameters: json!({"type": "object"}),
        safety,
        timeout_secs: 5,
        cache_ttl_secs: Some(30),
        headers: BTreeMap::from([("x-api-key".to_owned(), "secret".to_owned())]),
    }
}

async fn spawn_server(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test listener should bind");
    let address = listener
        .local_addr()
        .expect("test listener should expose local address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    address
}
