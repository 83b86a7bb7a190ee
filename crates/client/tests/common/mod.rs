use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use contentflow_client::http::HttpBackend;

/// Requests the fake backend received, in arrival order.
#[derive(Default)]
pub struct Recorded {
    pub bodies: Mutex<Vec<(String, Value)>>,
}

impl Recorded {
    pub fn take(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.bodies.lock().unwrap())
    }

    fn push(&self, route: &str, body: Value) {
        self.bodies.lock().unwrap().push((route.to_string(), body));
    }
}

type Shared = State<Arc<Recorded>>;

/// The SSE body served for every log stream: two lines, a comment, and
/// the completion event split over CRLF line endings.
pub const LOG_STREAM: &str = "event: log\ndata: {\"message\":\"step1\"}\n\n\
: keepalive\n\n\
event: log\ndata: {\"message\":\"step2\"}\n\n\
event: complete\r\ndata: {\"files\":[\"post.md\"]}\r\n\r\n";

async fn submit_brief(State(rec): Shared, Json(body): Json<Value>) -> Json<Value> {
    rec.push("briefs/generate", body);
    Json(json!({ "job_id": "job-1" }))
}

async fn submit_draft_batch(State(rec): Shared, Json(body): Json<Value>) -> Json<Value> {
    let count = body["drafts"].as_array().map(Vec::len).unwrap_or(0);
    rec.push("drafts/generate/batch", body);
    let job_ids: Vec<String> = (1..=count).map(|n| format!("draft-{n}")).collect();
    Json(json!({
        "batch_id": "b1",
        "job_ids": job_ids,
        "total_jobs": count,
        "message": format!("Batch of {count} draft(s) submitted successfully"),
    }))
}

async fn job_status(Path(id): Path<String>) -> impl IntoResponse {
    if id == "missing" {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "Job not found" })));
    }
    (
        StatusCode::OK,
        Json(json!({
            "id": id,
            "type": "draft",
            "status": "queued",
            "params": { "brief_filename": "b.md", "brand_data_filename": "acme.json" },
            "batch_id": "b1",
            "queue_position": 2,
        })),
    )
}

async fn job_logs(Path(id): Path<String>) -> impl IntoResponse {
    if id == "missing" {
        return (
            StatusCode::NOT_FOUND,
            [(CONTENT_TYPE, "application/json")],
            "{\"detail\":\"Log file not found\"}",
        );
    }
    (StatusCode::OK, [(CONTENT_TYPE, "text/event-stream")], LOG_STREAM)
}

async fn get_diff(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "filename": "post.md",
        "file_type": "draft",
        "original_content": "A",
        "edited_content": format!("B from {id}"),
    }))
}

async fn approve_diff(
    State(rec): Shared,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    rec.push(&format!("diffs/{id}/approve"), body);
    Json(json!({ "message": "Changes approved and applied" }))
}

async fn reject_diff(State(rec): Shared, Path(id): Path<String>) -> Json<Value> {
    rec.push(&format!("diffs/{id}/reject"), Value::Null);
    Json(json!({ "message": "Changes rejected" }))
}

async fn list_drafts() -> Json<Value> {
    Json(json!({
        "files": [
            { "name": "post.md", "created_at": 1_700_000_000.5, "size": 2100 },
            { "name": "old.md", "created_at": 1_600_000_000.0 },
        ]
    }))
}

async fn read_draft(Path(name): Path<String>) -> Json<Value> {
    Json(json!({ "content": format!("# {name}") }))
}

async fn read_brand_data(Path(name): Path<String>) -> Json<Value> {
    Json(json!({ "brand_name": name, "urls": ["https://example.com"] }))
}

async fn save_brand_data(State(rec): Shared, Json(body): Json<Value>) -> Json<Value> {
    rec.push("brand-data/save", body);
    Json(json!({ "message": "File saved successfully" }))
}

/// Serve the fake backend on an ephemeral port.
pub async fn spawn_backend() -> (HttpBackend, Arc<Recorded>) {
    let recorded = Arc::new(Recorded::default());
    let app = Router::new()
        .route("/briefs/generate", post(submit_brief))
        .route("/drafts/generate/batch", post(submit_draft_batch))
        .route("/jobs/{id}", get(job_status))
        .route("/jobs/{id}/logs", get(job_logs))
        .route("/diffs/{id}", get(get_diff))
        .route("/diffs/{id}/approve", post(approve_diff))
        .route("/diffs/{id}/reject", post(reject_diff))
        .route("/drafts", get(list_drafts))
        .route("/drafts/{name}", get(read_draft))
        .route("/brand-data/save", put(save_brand_data))
        .route("/brand-data/{name}", get(read_brand_data))
        .with_state(Arc::clone(&recorded));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let backend = HttpBackend::with_client(
        reqwest::Client::new(),
        format!("http://{addr}/"),
        Duration::from_secs(5),
    );
    (backend, recorded)
}
