use crate::agent::Agent;
use crate::error::AgentError;
use crate::request::{AgentRequest, Credentials};
use crate::server::AppState;
use crate::stream::ResponseWriter;
use axum::Extension;
use axum::body::Body;
use axum::http::HeaderMap;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const STREAM_BUFFER: usize = 16;

/// Caps agent runs that are still streaming. A permit lives as long as the
/// spawned agent task, not just until the response head is sent.
#[derive(Clone)]
struct AgentRuns(Arc<Semaphore>);

pub fn router(max_agent_runs: usize) -> axum::Router {
    axum::Router::new()
        .route("/", post(post_agent))
        .layer(Extension(AgentRuns(Arc::new(Semaphore::new(max_agent_runs)))))
}

#[tracing::instrument(level = "info", skip_all)]
async fn post_agent(
    Extension(state): Extension<Arc<AppState>>,
    Extension(runs): Extension<AgentRuns>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match start_response(state, runs, &headers, &body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Runs the agent in its own task and waits for the first unit. If the task
/// ends without writing anything, its error becomes a status-coded response;
/// otherwise the remaining units are streamed as they arrive.
async fn start_response(
    state: Arc<AppState>,
    runs: AgentRuns,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AgentError> {
    let credentials = Credentials::from_headers(headers)?;
    let request = AgentRequest::parse(body)?;
    let collaborators = state.backends.connect(&credentials)?;
    tracing::info!(
        messages = request.messages.len(),
        has_integration_id = credentials.integration_id.is_some(),
        "agent request accepted"
    );

    let permit = runs
        .0
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| AgentError::Internal(format!("agent run limiter closed: {e}")))?;
    tracing::debug!(
        available = runs.0.available_permits(),
        "agent run permit acquired"
    );

    let (mut writer, mut rx) = ResponseWriter::channel(STREAM_BUFFER);
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task = tokio::spawn(
        async move {
            let _permit = permit;
            let agent = Agent::new(
                &state.registry,
                collaborators.gateway.as_ref(),
                collaborators.tracker.as_ref(),
            )
            .with_system_prompt(state.system_prompt.as_deref());
            tokio::select! {
                result = agent.respond(request, &mut writer) => result.map(|_| ()),
                _ = task_cancel.cancelled() => {
                    tracing::info!("agent request cancelled; client went away");
                    Ok(())
                }
            }
        }
        .instrument(tracing::Span::current()),
    );
    // Dropping the guard (with the handler future or the body) cancels the task.
    let guard = cancel.drop_guard();

    let Some(first) = rx.recv().await else {
        return match task.await {
            Ok(Ok(())) => Err(AgentError::Internal(
                "agent finished without writing a response".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(AgentError::Internal(format!("agent task failed: {e}"))),
        };
    };

    let stream = futures_util::stream::unfold(
        (Some(first), rx, guard),
        |(pending, mut rx, guard)| async move {
            let next = match pending {
                Some(bytes) => Some(bytes),
                None => rx.recv().await,
            };
            next.map(|bytes| (Ok::<_, Infallible>(bytes), (None, rx, guard)))
        },
    );

    Ok((
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
