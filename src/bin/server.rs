//! HTTP server for the BI assistant
//! Minimal HTTP/1.1 JSON endpoints on tokio, one request per connection

use bi_assistant::error::ErrorKind;
use bi_assistant::guardrail::{Allowlist, CandidateQuery};
use bi_assistant::observability::init_tracing;
use bi_assistant::{AppConfig, BiError, Orchestrator, WarehouseTarget};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Deserialize)]
struct AnswerRequest {
    question: String,
    #[serde(default)]
    warehouse: Option<String>,
}

#[derive(Deserialize)]
struct ValidateRequest {
    sql: String,
    #[serde(default)]
    allow: Vec<String>,
}

struct AppState {
    config: AppConfig,
    orchestrator: Orchestrator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.log_level);
    config.validate()?;

    let addr = config.server_addr.clone();
    info!("Starting BI assistant API server...");

    let orchestrator = Orchestrator::bootstrap(&config).await?;
    let state = Arc::new(AppState { config, orchestrator });

    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("New connection from: {}", peer);
        tokio::spawn(handle_connection(stream, Arc::clone(&state)));
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    let response = match read_request(&mut stream).await {
        Ok(Some(request)) => handle_request(&request, &state).await,
        Ok(None) => return,
        Err(e) => {
            warn!("Failed to read request: {}", e);
            create_response(400, "Bad Request", &json!({"error": "InvalidRequest", "detail": e}).to_string())
        }
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

struct Request {
    method: String,
    path: String,
    body: String,
}

/// Read the head, then as many body bytes as Content-Length announces.
async fn read_request(stream: &mut TcpStream) -> Result<Option<Request>, String> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let n = stream.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return if buffer.is_empty() { Ok(None) } else { Err("connection closed mid-request".to_string()) };
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subsequence(&buffer, b"\r\n\r\n") {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err("request too large".to_string());
        }
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err("malformed request line".to_string());
    }

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Err("request too large".to_string());
    }

    let body_start = head_end + 4;
    while buffer.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    let body_end = buffer.len().min(body_start + content_length);

    // Normalize path: drop the query string and any trailing slash
    let mut path = parts[1].split('?').next().unwrap_or("/").trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }

    Ok(Some(Request {
        method: parts[0].to_string(),
        path,
        body: String::from_utf8_lossy(&buffer[body_start.min(body_end)..body_end]).to_string(),
    }))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn handle_request(request: &Request, state: &AppState) -> String {
    info!("Request: {} {}", request.method, request.path);

    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("GET", "/api/health") => health(state),
        ("POST", "/api/answer") => match serde_json::from_str::<AnswerRequest>(&request.body) {
            Ok(body) => answer(state, body).await,
            Err(e) => bad_request(&format!("Invalid answer request: {}", e)),
        },
        ("POST", "/api/validate") => match serde_json::from_str::<ValidateRequest>(&request.body) {
            Ok(body) => validate(state, body),
            Err(e) => bad_request(&format!("Invalid validate request: {}", e)),
        },
        ("POST", "/api/rebuild") => match state.orchestrator.catalog().rebuild().await {
            Ok(snapshot) => ok(json!({
                "entries": snapshot.index.len(),
                "catalog_hash": snapshot.catalog_hash(),
                "degraded": snapshot.is_degraded(),
                "loaded_at": snapshot.loaded_at,
            })),
            Err(e) => error_response(&e),
        },
        _ => create_response(404, "Not Found", r#"{"error":"Not Found"}"#),
    }
}

fn health(state: &AppState) -> String {
    let catalog = state.orchestrator.catalog().snapshot().ok();
    let warehouses: Vec<String> = state
        .orchestrator
        .router()
        .targets()
        .iter()
        .map(|t| t.to_string())
        .collect();
    ok(json!({
        "status": if catalog.is_some() { "ok" } else { "degraded" },
        "service": "bi-assistant",
        "default_warehouse": state.config.warehouse,
        "warehouses": warehouses,
        "catalog_entries": catalog.as_ref().map(|s| s.index.len()),
        "catalog_hash": catalog.as_ref().map(|s| s.catalog_hash().to_string()),
        "lexical_only": catalog.as_ref().map(|s| s.is_degraded()),
    }))
}

async fn answer(state: &AppState, body: AnswerRequest) -> String {
    let target = match body.warehouse.as_deref() {
        Some(name) => match name.parse::<WarehouseTarget>() {
            Ok(target) => target,
            Err(e) => return error_response(&e),
        },
        None => state.config.warehouse,
    };

    match state.orchestrator.answer(&body.question, target).await {
        Ok(answer) => match serde_json::to_value(&answer) {
            Ok(value) => ok(value),
            Err(e) => error_response(&BiError::Execution(format!("Failed to serialize answer: {}", e))),
        },
        Err(e) => error_response(&e),
    }
}

fn validate(state: &AppState, body: ValidateRequest) -> String {
    let allowlist = if body.allow.is_empty() {
        match state.orchestrator.catalog().snapshot() {
            Ok(snapshot) => Allowlist::from_entries(snapshot.index.entries()),
            Err(e) => return error_response(&e),
        }
    } else {
        Allowlist::new(body.allow)
    };
    let allowlist = allowlist.with_reference_patterns(&state.config.limits.allowed_schemas);

    let verdict = state.orchestrator.guardrail().validate(&CandidateQuery::new(body.sql), &allowlist);
    match serde_json::to_value(&verdict) {
        Ok(value) => ok(value),
        Err(e) => error_response(&BiError::Execution(format!("Failed to serialize verdict: {}", e))),
    }
}

fn status_for(kind: ErrorKind) -> (u16, &'static str) {
    match kind {
        ErrorKind::InvalidRequest => (400, "Bad Request"),
        ErrorKind::UnsafeQuery
        | ErrorKind::NotSelect
        | ErrorKind::SchemaViolation
        | ErrorKind::BlockedFunction
        | ErrorKind::BlockedKeyword => (422, "Unprocessable Entity"),
        ErrorKind::ModelTimeout | ErrorKind::QueryTimeout => (504, "Gateway Timeout"),
        ErrorKind::ExecutionError => (502, "Bad Gateway"),
        ErrorKind::CatalogUnavailable
        | ErrorKind::EmbeddingServiceError
        | ErrorKind::ModelUnavailable
        | ErrorKind::ConnectionError => (503, "Service Unavailable"),
    }
}

fn error_response(error: &BiError) -> String {
    let kind = error.kind();
    let (status, text) = status_for(kind);
    create_response(
        status,
        text,
        &json!({"error": kind, "detail": error.to_string()}).to_string(),
    )
}

fn bad_request(detail: &str) -> String {
    create_response(
        400,
        "Bad Request",
        &json!({"error": ErrorKind::InvalidRequest, "detail": detail}).to_string(),
    )
}

fn ok(body: serde_json::Value) -> String {
    create_response(200, "OK", &body.to_string())
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
