use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use http::StatusCode;
use minijinja::{Environment, context};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    ledger::{Ledger, LedgerError},
    model::{LatestVersion, UpdatedApplication, VersionRecord},
    reconciler::{ReconcileError, reconcile},
    workload::{SourceError, WorkloadSource},
};

const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// First path segments taken by fixed routes. A context with one of these names could not be
/// reached through `/{context}`.
const RESERVED_CONTEXTS: &[&str] = &["api", "health", "update-version-history"];

pub fn is_reserved_context(name: &str) -> bool {
    RESERVED_CONTEXTS.contains(&name)
}

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub source: Arc<dyn WorkloadSource>,
    pub templates: Arc<Environment<'static>>,
}

impl AppState {
    pub fn new(ledger: Ledger, source: Arc<dyn WorkloadSource>) -> Result<Self, minijinja::Error> {
        Ok(Self {
            ledger,
            source,
            templates: Arc::new(load_templates()?),
        })
    }
}

pub fn load_templates() -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("base.html", include_str!("../templates/base.html"))?;
    env.add_template("index.html", include_str!("../templates/index.html"))?;
    env.add_template("show.html", include_str!("../templates/show.html"))?;
    env.add_template("error.html", include_str!("../templates/error.html"))?;
    Ok(env)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/update-version-history/{context}", get(update_version_history))
        .route("/api/contexts", get(read_contexts))
        .route("/api/contexts/{context}/versions", get(read_latest_versions))
        .route(
            "/api/contexts/{context}/applications/{application}/versions",
            get(read_version_history),
        )
        .route("/{context}", get(context_page))
        .route("/{context}/{application}", get(application_page))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no k8s context with name '{0}' could be found")]
    UnknownContext(String),

    #[error("'{0}' is a reserved name and can't be used as a k8s context")]
    ReservedContext(String),

    #[error("Can't read the workloads of the cluster: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Can't render the page: {0}")]
    Render(#[from] minijinja::Error),
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Source(e) => ApiError::Source(e),
            ReconcileError::Ledger(e) => ApiError::Ledger(e),
        }
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::UnknownContext(_) => StatusCode::NOT_FOUND,
            ApiError::ReservedContext(_) => StatusCode::BAD_REQUEST,
            ApiError::Source(_) => StatusCode::BAD_GATEWAY,
            ApiError::Ledger(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn log(&self) {
        if self.status_code().is_server_error() {
            error!("{self}");
        } else {
            debug!("{self}");
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.log();
        let body = ErrorMessage {
            error: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

async fn require_context(state: &AppState, context: &str) -> Result<(), ApiError> {
    if state.ledger.context_exists(context).await? {
        Ok(())
    } else {
        Err(ApiError::UnknownContext(context.to_string()))
    }
}

async fn health() -> &'static str {
    "OK"
}

#[tracing::instrument(skip(state))]
async fn update_version_history(
    State(state): State<AppState>,
    Path(context): Path<String>,
) -> Result<Json<Vec<UpdatedApplication>>, ApiError> {
    if is_reserved_context(&context) {
        return Err(ApiError::ReservedContext(context));
    }
    let updated = reconcile(state.source.as_ref(), &state.ledger, &context).await?;
    Ok(Json(updated))
}

async fn read_contexts(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.ledger.list_contexts().await?))
}

#[tracing::instrument(skip(state))]
async fn read_latest_versions(
    State(state): State<AppState>,
    Path(context): Path<String>,
) -> Result<Json<Vec<LatestVersion>>, ApiError> {
    require_context(&state, &context).await?;
    Ok(Json(state.ledger.latest_versions(&context).await?))
}

#[tracing::instrument(skip(state))]
async fn read_version_history(
    State(state): State<AppState>,
    Path((context, application)): Path<(String, String)>,
) -> Result<Json<Vec<VersionRecord>>, ApiError> {
    require_context(&state, &context).await?;
    Ok(Json(state.ledger.all_versions(&application, &context).await?))
}

fn render(state: &AppState, name: &str, ctx: minijinja::Value) -> Result<String, ApiError> {
    Ok(state.templates.get_template(name)?.render(ctx)?)
}

async fn page(state: &AppState, result: Result<String, ApiError>) -> Response {
    match result {
        Ok(body) => Html(body).into_response(),
        Err(err) => error_page(state, err).await,
    }
}

async fn error_page(state: &AppState, err: ApiError) -> Response {
    err.log();
    let contexts = state.ledger.list_contexts().await.unwrap_or_default();
    let rendered = render(
        state,
        "error.html",
        context! {
            error => err.to_string(),
            contexts => contexts,
        },
    );

    match rendered {
        Ok(body) => (err.status_code(), Html(body)).into_response(),
        Err(render_err) => {
            error!("{render_err}");
            (err.status_code(), err.to_string()).into_response()
        }
    }
}

async fn index(State(state): State<AppState>) -> Response {
    let result = render_index(&state).await;
    page(&state, result).await
}

async fn render_index(state: &AppState) -> Result<String, ApiError> {
    let contexts = state.ledger.list_contexts().await?;
    render(
        state,
        "error.html",
        context! {
            error => "select a kubernetes context from the menu",
            contexts => contexts,
        },
    )
}

#[tracing::instrument(skip(state))]
async fn context_page(State(state): State<AppState>, Path(context): Path<String>) -> Response {
    let result = render_latest_versions(&state, &context).await;
    page(&state, result).await
}

async fn render_latest_versions(state: &AppState, context: &str) -> Result<String, ApiError> {
    require_context(state, context).await?;
    let contexts = state.ledger.list_contexts().await?;
    let versions = state.ledger.latest_versions(context).await?;
    render(
        state,
        "index.html",
        context! {
            selected_context => context,
            contexts => contexts,
            versions => versions,
        },
    )
}

#[tracing::instrument(skip(state))]
async fn application_page(
    State(state): State<AppState>,
    Path((context, application)): Path<(String, String)>,
) -> Response {
    let result = render_version_history(&state, &context, &application).await;
    page(&state, result).await
}

async fn render_version_history(
    state: &AppState,
    context: &str,
    application: &str,
) -> Result<String, ApiError> {
    require_context(state, context).await?;
    let contexts = state.ledger.list_contexts().await?;
    let versions: Vec<_> = state
        .ledger
        .all_versions(application, context)
        .await?
        .into_iter()
        .map(|r| {
            context! {
                version => r.version,
                created => r.created.format(CREATED_FORMAT).to_string(),
            }
        })
        .collect();
    render(
        state,
        "show.html",
        context! {
            selected_context => context,
            application => application,
            contexts => contexts,
            versions => versions,
        },
    )
}
