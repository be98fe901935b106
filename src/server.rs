use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as ResponseJson, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::config::{self, Config};
use crate::task::{self, SourceOptions};
use crate::workflow::{self, PrdOptions, RunDeps, SingleOptions};

/// Shared state for the control plane.
#[derive(Clone)]
pub struct AppState {
    pub cwd: PathBuf,
}

/// A running control plane bound to an ephemeral loopback port.
///
/// The server lives on a detached background runtime thread; it exists for
/// exactly one CLI invocation and dies with the process.
pub struct ServerHandle {
    pub base_url: String,
}

/// Boot the control plane and return once it is accepting connections.
pub fn spawn(cwd: PathBuf) -> Result<ServerHandle> {
    let (tx, rx) = std::sync::mpsc::channel::<Result<SocketAddr>>();

    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("Failed to start control plane runtime")
        {
            Ok(runtime) => runtime,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };

        runtime.block_on(async move {
            let listener = match tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .context("Failed to bind control plane port")
            {
                Ok(listener) => listener,
                Err(err) => {
                    let _ = tx.send(Err(err));
                    return;
                }
            };
            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    let _ = tx.send(Err(err.into()));
                    return;
                }
            };
            let _ = tx.send(Ok(addr));

            if let Err(err) = axum::serve(listener, router(AppState { cwd })).await {
                error!(error = %err, "server:terminated");
            }
        });
    });

    let addr = rx
        .recv()
        .context("Control plane thread died before binding")??;
    info!(addr = %addr, "server:listening");
    Ok(ServerHandle {
        base_url: format!("http://{}", addr),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/version", get(version))
        .route("/v1/config/init", post(config_init))
        .route("/v1/config", get(config_show))
        .route("/v1/config/rules", post(config_add_rule))
        .route("/v1/tasks/next", get(tasks_next))
        .route("/v1/tasks/complete", post(tasks_complete))
        .route("/v1/run/single", post(run_single))
        .route("/v1/run/prd", post(run_prd))
        .fallback(not_found)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    ResponseJson(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn version() -> impl IntoResponse {
    ResponseJson(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn config_init(State(state): State<AppState>) -> Response {
    match config::init(&state.cwd) {
        Ok(path) => ResponseJson(json!({
            "status": "created",
            "path": path.display().to_string(),
        }))
        .into_response(),
        Err(err) if err.is::<config::ConfigExists>() => {
            error_response(StatusCode::CONFLICT, &err.to_string())
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn config_show(State(state): State<AppState>) -> Response {
    match Config::load(&state.cwd) {
        Ok(config) => ResponseJson(config).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct RulePayload {
    #[serde(default)]
    rule: Option<String>,
}

async fn config_add_rule(
    State(state): State<AppState>,
    Json(payload): Json<RulePayload>,
) -> Response {
    let Some(rule) = payload
        .rule
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or empty rule");
    };

    match config::add_rule(&state.cwd, rule) {
        Ok(()) => ResponseJson(json!({ "status": "added", "rule": rule })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn tasks_next(
    State(state): State<AppState>,
    Query(source): Query<SourceOptions>,
) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        let deps = RunDeps::default();
        task::select_source(&source, &state.cwd, deps.gh.clone()).next()
    })
    .await;

    match result {
        Ok(outcome) => ResponseJson(outcome).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct CompletePayload {
    #[serde(default)]
    task: String,
    #[serde(flatten)]
    source: SourceOptions,
}

async fn tasks_complete(
    State(state): State<AppState>,
    Json(payload): Json<CompletePayload>,
) -> Response {
    if payload.task.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing or empty task");
    }

    let result = tokio::task::spawn_blocking(move || {
        let deps = RunDeps::default();
        task::select_source(&payload.source, &state.cwd, deps.gh.clone()).complete(&payload.task)
    })
    .await;

    match result {
        Ok(outcome) => ResponseJson(outcome).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn run_single(
    State(state): State<AppState>,
    Json(options): Json<SingleOptions>,
) -> Response {
    if options.task.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing or empty task");
    }

    let result = tokio::task::spawn_blocking(move || {
        let deps = RunDeps::default();
        workflow::run_single(&state.cwd, &options, &deps)
    })
    .await;

    match result {
        Ok(outcome) => ResponseJson(outcome).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn run_prd(State(state): State<AppState>, Json(options): Json<PrdOptions>) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        let deps = RunDeps::default();
        workflow::run_prd(&state.cwd, &options, &deps)
    })
    .await;

    match result {
        Ok(outcome) => ResponseJson(outcome).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, ResponseJson(json!({ "error": "Not Found" }))).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, ResponseJson(json!({ "error": message }))).into_response()
}
