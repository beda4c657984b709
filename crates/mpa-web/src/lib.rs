//! Axum JSON API over the analysis poller: start, inspect and control
//! sessions, read stored records and the shared log buffer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use mpa_core::{normalize_domain_key, Flow, LogCategory};
use mpa_sync::{AnalysisServices, PollConfig, PollSnapshot, Poller, UserAction};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpa-web";

/// Sessions kept in memory before finished ones are evicted.
pub const DEFAULT_MAX_ANALYSES: usize = 256;

pub struct Analysis {
    pub id: Uuid,
    pub domain: String,
    pub poller: Poller,
    registered: Instant,
}

impl Analysis {
    pub fn new(domain: String, poller: Poller) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain,
            poller,
            registered: Instant::now(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub services: AnalysisServices,
    pub poll_config: PollConfig,
    capacity: usize,
    analyses: Arc<RwLock<HashMap<Uuid, Arc<Analysis>>>>,
}

impl AppState {
    pub fn new(services: AnalysisServices, poll_config: PollConfig) -> Self {
        Self {
            services,
            poll_config,
            capacity: DEFAULT_MAX_ANALYSES,
            analyses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn analysis_count(&self) -> usize {
        self.analyses.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn analysis(&self, id: Uuid) -> Option<Arc<Analysis>> {
        self.analyses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Evicts finished sessions, oldest first, until a slot is free.
    /// Returns false when every kept session is still polling.
    fn make_room(analyses: &mut HashMap<Uuid, Arc<Analysis>>, capacity: usize) -> bool {
        if analyses.len() < capacity {
            return true;
        }
        let mut idle: Vec<(Instant, Uuid)> = analyses
            .values()
            .filter(|a| !a.poller.is_active())
            .map(|a| (a.registered, a.id))
            .collect();
        idle.sort();
        for (_, id) in idle {
            if analyses.len() < capacity {
                break;
            }
            analyses.remove(&id);
            debug!(%id, "evicted finished analysis");
        }
        analyses.len() < capacity
    }

    fn has_room(&self) -> bool {
        let mut analyses = self.analyses.write().unwrap_or_else(|e| e.into_inner());
        Self::make_room(&mut analyses, self.capacity)
    }

    fn register(&self, analysis: Analysis) -> Option<Arc<Analysis>> {
        let mut analyses = self.analyses.write().unwrap_or_else(|e| e.into_inner());
        if !Self::make_room(&mut analyses, self.capacity) {
            return None;
        }
        let analysis = Arc::new(analysis);
        analyses.insert(analysis.id, analysis.clone());
        Some(analysis)
    }

    fn remove(&self, id: Uuid) -> Option<Arc<Analysis>> {
        self.analyses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    domain: String,
    #[serde(default)]
    flow: Option<Flow>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordsQuery {
    flow: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    category: Option<LogCategory>,
}

#[derive(Debug, Serialize)]
struct AnalysisView {
    id: Uuid,
    domain: String,
    key: String,
    snapshot: PollSnapshot,
    user_message: Option<&'static str>,
    user_action: Option<UserAction>,
}

impl AnalysisView {
    fn of(analysis: &Analysis) -> Self {
        let snapshot = analysis.poller.snapshot();
        let user_message = snapshot.error.as_ref().map(|e| e.user_message());
        let user_action = snapshot.error.as_ref().map(|e| e.user_action());
        Self {
            id: analysis.id,
            domain: analysis.domain.clone(),
            key: analysis.poller.key().to_string(),
            snapshot,
            user_message,
            user_action,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/analyses", post(start_analysis_handler))
        .route("/analyses/{id}", get(analysis_handler).delete(delete_handler))
        .route("/analyses/{id}/stop", post(stop_handler))
        .route("/analyses/{id}/restart", post(restart_handler))
        .route("/analyses/{id}/reset", post(reset_handler))
        .route("/records/{domain}", get(record_handler))
        .route("/logs", get(logs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("MPA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let capacity = std::env::var("MPA_WEB_MAX_ANALYSES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_ANALYSES);
    let services = AnalysisServices::from_env().await?;
    let state = AppState::new(services, PollConfig::from_env()).with_capacity(capacity);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving analysis api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok", "service": CRATE_NAME})).into_response()
}

async fn start_analysis_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Response {
    let domain = req.domain.trim().to_string();
    if normalize_domain_key(&domain).is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "domain must not be empty");
    }
    let flow = req.flow.unwrap_or(Flow::Plan);
    if !state.has_room() {
        return too_many_analyses();
    }

    match state
        .services
        .begin(&domain, flow, state.poll_config.clone(), None)
        .await
    {
        Ok(poller) => {
            let Some(analysis) = state.register(Analysis::new(domain, poller)) else {
                return too_many_analyses();
            };
            info!(id = %analysis.id, key = analysis.poller.key(), %flow, "analysis started");
            (StatusCode::ACCEPTED, Json(AnalysisView::of(&analysis))).into_response()
        }
        Err(err) => {
            warn!(%domain, %flow, error = %format!("{err:#}"), "starting analysis failed");
            error_response(StatusCode::BAD_GATEWAY, &format!("{err:#}"))
        }
    }
}

async fn analysis_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.analysis(id) {
        Some(analysis) => Json(AnalysisView::of(&analysis)).into_response(),
        None => not_found(id),
    }
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.remove(id) {
        Some(analysis) => {
            analysis.poller.stop();
            info!(%id, "analysis removed");
            StatusCode::NO_CONTENT.into_response()
        }
        None => not_found(id),
    }
}

async fn stop_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.analysis(id) {
        Some(analysis) => {
            analysis.poller.stop();
            Json(AnalysisView::of(&analysis)).into_response()
        }
        None => not_found(id),
    }
}

async fn restart_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.analysis(id) {
        Some(analysis) => {
            analysis.poller.restart().await;
            Json(AnalysisView::of(&analysis)).into_response()
        }
        None => not_found(id),
    }
}

async fn reset_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.analysis(id) {
        Some(analysis) => {
            analysis.poller.reset();
            Json(AnalysisView::of(&analysis)).into_response()
        }
        None => not_found(id),
    }
}

async fn record_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(domain): AxumPath<String>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let flow = match query.flow.as_deref().map(str::parse::<Flow>) {
        None => Flow::Plan,
        Some(Ok(flow)) => flow,
        Some(Err(msg)) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let Some(reconciler) = &state.services.reconciler else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no record store configured");
    };

    let outcome = reconciler.load(&domain, flow).await;
    match (outcome.success, outcome.record) {
        (true, Some(record)) => Json(record).into_response(),
        (true, None) => error_response(
            StatusCode::NOT_FOUND,
            &format!("no {flow} record for {}", normalize_domain_key(&domain)),
        ),
        (false, _) => {
            let message = outcome
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "loading record failed".to_string());
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &message)
        }
    }
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let entries = match query.category {
        Some(category) => state.services.logs.by_category(category),
        None => state.services.logs.snapshot(),
    };
    Json(entries).into_response()
}

fn too_many_analyses() -> Response {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "too many analyses in progress, try again later",
    )
}

fn not_found(id: Uuid) -> Response {
    error_response(StatusCode::NOT_FOUND, &format!("no analysis {id}"))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use mpa_storage::{JobStarter, MemoryRecordStore, RecordStore, RemoteError, StatusSource};
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    struct FakeRemote {
        fail_start: bool,
        complete: bool,
    }

    #[async_trait]
    impl JobStarter for FakeRemote {
        async fn start_job(&self, domain: &str, _flow: Flow) -> Result<String, RemoteError> {
            if self.fail_start {
                return Err(RemoteError::HttpStatus {
                    status: 503,
                    url: "http://api.test/analyses".to_string(),
                    reason: "Service Unavailable".to_string(),
                });
            }
            Ok(format!("conv-{domain}"))
        }
    }

    #[async_trait]
    impl StatusSource for FakeRemote {
        async fn check_status(&self, _key: &str, _attempt: u32) -> Result<JsonValue, RemoteError> {
            if !self.complete {
                return Ok(json!({"status": "running"}));
            }
            Ok(json!({
                "status": "succeeded",
                "response": {"data": {"content": {
                    "company_summary": {"name": "Acme", "industry": "SaaS", "target": "SMBs"},
                    "programs_list": [{"program_name": "X"}]
                }}}
            }))
        }
    }

    fn state(fail_start: bool, complete: bool) -> AppState {
        let remote = Arc::new(FakeRemote {
            fail_start,
            complete,
        });
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let services = AnalysisServices::new(remote.clone(), remote, Some(store));
        AppState::new(services, PollConfig::default())
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: JsonValue) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_empty(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn delete_req(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn start(app: &Router, domain: &str) -> Response {
        app.clone()
            .oneshot(post_json("/analyses", json!({"domain": domain})))
            .await
            .unwrap()
    }

    async fn body_json(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let resp = app(state(false, true)).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn analysis_runs_to_success_and_is_stored() {
        let state = state(false, true);
        let app = app(state.clone());

        let resp = app
            .clone()
            .oneshot(post_json("/analyses", json!({"domain": "https://www.Acme.com", "flow": "plan"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let started = body_json(resp).await;
        assert_eq!(started["key"], "conv-https://www.Acme.com");
        let id: Uuid = started["id"].as_str().unwrap().parse().unwrap();

        let finished = state.analysis(id).unwrap().poller.finished().await;
        assert!(finished.status.is_terminal());

        let resp = app.clone().oneshot(get(&format!("/analyses/{id}"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let view = body_json(resp).await;
        assert_eq!(view["snapshot"]["status"]["state"], "success");
        assert_eq!(view["snapshot"]["data"]["items"][0]["name"], "X");
        assert!(view["user_message"].is_null());

        let resp = app.clone().oneshot(get("/records/acme.com?flow=plan")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let record = body_json(resp).await;
        assert_eq!(record["normalized_key"], "acme.com");
        assert_eq!(record["version_no"], 1);

        let resp = app.oneshot(get("/logs?category=request")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!body_json(resp).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_job_start_is_a_bad_gateway() {
        let resp = app(state(true, true))
            .oneshot(post_json("/analyses", json!({"domain": "acme.com"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn empty_domain_is_rejected() {
        let resp = app(state(false, true))
            .oneshot(post_json("/analyses", json!({"domain": "  https://www. "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stop_and_reset_control_a_running_analysis() {
        let state = state(false, false);
        let app = app(state.clone());

        let started = body_json(
            app.clone()
                .oneshot(post_json("/analyses", json!({"domain": "globex.com", "flow": "competitor"})))
                .await
                .unwrap(),
        )
        .await;
        let id = started["id"].as_str().unwrap().to_string();
        assert_eq!(started["snapshot"]["flow"], "competitor");

        let resp = app
            .clone()
            .oneshot(post_empty(&format!("/analyses/{id}/stop")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["snapshot"]["active"], false);

        let resp = app
            .clone()
            .oneshot(post_empty(&format!("/analyses/{id}/reset")))
            .await
            .unwrap();
        let view = body_json(resp).await;
        assert_eq!(view["snapshot"]["attempt"], 0);
        assert_eq!(view["snapshot"]["status"]["state"], "idle");

        let resp = app.oneshot(get("/records/globex.com?flow=competitor")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_analysis_and_bad_flow() {
        let app = app(state(false, true));
        let resp = app
            .clone()
            .oneshot(get(&format!("/analyses/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app.oneshot(get("/records/acme.com?flow=banana")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn finished_analyses_are_evicted_past_capacity() {
        let state = state(false, true).with_capacity(2);
        let app = app(state.clone());

        let mut ids = Vec::new();
        for domain in ["acme.com", "globex.com", "initech.com"] {
            let resp = start(&app, domain).await;
            assert_eq!(resp.status(), StatusCode::ACCEPTED);
            let id: Uuid = body_json(resp).await["id"].as_str().unwrap().parse().unwrap();
            state.analysis(id).unwrap().poller.finished().await;
            ids.push(id);
        }

        assert_eq!(state.analysis_count(), 2);
        assert!(state.analysis(ids[0]).is_none());
        assert!(state.analysis(ids[1]).is_some());
        assert!(state.analysis(ids[2]).is_some());

        let resp = app.oneshot(get(&format!("/analyses/{}", ids[0]))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn running_analyses_are_kept_and_can_be_deleted() {
        let state = state(false, false).with_capacity(1);
        let app = app(state.clone());

        let resp = start(&app, "acme.com").await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let id = body_json(resp).await["id"].as_str().unwrap().to_string();

        let resp = start(&app, "globex.com").await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.analysis_count(), 1);

        let resp = app
            .clone()
            .oneshot(delete_req(&format!("/analyses/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.analysis_count(), 0);

        let resp = app
            .clone()
            .oneshot(delete_req(&format!("/analyses/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = start(&app, "globex.com").await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(state.analysis_count(), 1);
    }
}
