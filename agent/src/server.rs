use crate::{
    queue::{jobs_in_queue, QueueError},
    submit::{SubmitError, SubmitRequest, Submitter},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::{future::Future, io, net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct AgentState {
    pub submitter: Arc<Submitter>,
}

impl AgentState {
    pub fn new(submitter: Submitter) -> Self {
        Self {
            submitter: Arc::new(submitter),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct SchedulerQuery {
    schedd: Option<String>,
}

pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/condor/submit", post(submit_handler))
        .route("/condor/queue/{cluster}", get(queue_handler))
        .with_state(state)
}

/// Serve the agent on `addr` until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, state: AgentState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Condor agent listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn submit_handler(
    State(state): State<AgentState>,
    Query(query): Query<SchedulerQuery>,
    body: String,
) -> Response {
    let request = SubmitRequest::new(body).scheduler(query.schedd);
    let submitter = state.submitter.clone();

    match tokio::task::spawn_blocking(move || submitter.submit(&request)).await {
        // clients read the body verbatim as the cluster id, it must not carry a trailing newline
        Ok(Ok(submission)) => submission.cluster_id.to_string().into_response(),
        Ok(Err(error)) => {
            warn!(error = ?error, "Submission failed");

            (submit_status(&error), error.to_string()).into_response()
        }
        Err(error) => {
            error!(error = ?error, "Submission task failed");

            (StatusCode::INTERNAL_SERVER_ERROR, "submission task failed").into_response()
        }
    }
}

async fn queue_handler(
    State(state): State<AgentState>,
    Path(cluster): Path<u64>,
    Query(query): Query<SchedulerQuery>,
) -> Response {
    let submitter = state.submitter.clone();
    let scheduler = query.schedd.filter(|name| !name.trim().is_empty());

    match tokio::task::spawn_blocking(move || {
        jobs_in_queue(&submitter.config().commands, scheduler.as_deref(), cluster)
    })
    .await
    {
        Ok(Ok(jobs)) => jobs.to_string().into_response(),
        Ok(Err(error)) => {
            warn!(error = ?error, cluster, "Queue query failed");

            (queue_status(&error), error.to_string()).into_response()
        }
        Err(error) => {
            error!(error = ?error, "Queue task failed");

            (StatusCode::INTERNAL_SERVER_ERROR, "queue task failed").into_response()
        }
    }
}

fn submit_status(error: &SubmitError) -> StatusCode {
    match error {
        SubmitError::NoSubmitDir => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::EmptyDescription | SubmitError::InvalidFileName(_) => StatusCode::BAD_REQUEST,
        SubmitError::Rejected(_) | SubmitError::NoClusterId => StatusCode::BAD_GATEWAY,
        SubmitError::Io(_) | SubmitError::Command(_) | SubmitError::ClusterFile(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn queue_status(error: &QueueError) -> StatusCode {
    match error {
        QueueError::Stderr(_) | QueueError::Failed(_) => StatusCode::BAD_GATEWAY,
        QueueError::Command(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
