//! issuepilot server.
//!
//! Wires config into the per-request backends, mounts the health and agent
//! routes, and runs until ctrl-c or SIGTERM.

use crate::backends::{Backends, HttpBackends};
use crate::config::IssuePilotConfig;
use crate::http_auth::{self, GithubKeyVerifier, SignaturePolicy, SignaturePolicyExt};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use ip_tools::ToolRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub registry: ToolRegistry,
    pub backends: Arc<dyn Backends>,
    pub system_prompt: Option<String>,
}

pub struct RouterOptions {
    pub http_timeout: Duration,
    pub http_max_in_flight: usize,
    pub max_body_bytes: usize,
    /// `None` serves the agent endpoint unsigned.
    pub signature: Option<SignaturePolicy>,
}

impl RouterOptions {
    pub fn from_config(cfg: &IssuePilotConfig) -> Result<Self> {
        let signature = if cfg.security.verify_signatures {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.github.request_timeout_seconds))
                .build()
                .map_err(|e| anyhow::anyhow!("build public key http client: {e}"))?;
            Some(SignaturePolicy {
                verifier: Arc::new(
                    GithubKeyVerifier::new(
                        http,
                        &cfg.security.public_keys_url,
                        &cfg.github.user_agent,
                    )
                    .with_min_refresh_interval(Duration::from_secs(
                        cfg.security.key_refresh_min_interval_seconds,
                    )),
                ),
                max_body_bytes: cfg.server.max_body_bytes,
            })
        } else {
            None
        };
        Ok(Self {
            http_timeout: Duration::from_secs(cfg.server.http_timeout_seconds),
            http_max_in_flight: cfg.server.http_max_in_flight,
            max_body_bytes: cfg.server.max_body_bytes,
            signature,
        })
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = IssuePilotConfig::load_with_path(config_path).await?;
    HttpBackends::from_config(&cfg)?;
    let registry = ToolRegistry::builtin();
    tracing::info!(
        config_path = ?path.map(|p| p.display().to_string()),
        bind_addr = %cfg.bind_addr()?,
        model = %cfg.completion.model,
        completion_base_url = %cfg.completion.base_url,
        github_api_base_url = %cfg.github.api_base_url,
        verify_signatures = cfg.security.verify_signatures,
        tool_count = registry.declarations().len(),
        "config ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = IssuePilotConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = ?path.map(|p| p.display().to_string()),
        bind_addr = %addr,
        model = %cfg.completion.model,
        completion_base_url = %cfg.completion.base_url,
        github_api_base_url = %cfg.github.api_base_url,
        verify_signatures = cfg.security.verify_signatures,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        "issuepilot config loaded"
    );
    if !cfg.security.verify_signatures {
        tracing::warn!("request signature verification is disabled; accepting unsigned requests");
    }

    let listener = preflight_bind_listener(addr).await?;

    let state = Arc::new(AppState {
        registry: ToolRegistry::builtin(),
        backends: Arc::new(HttpBackends::from_config(&cfg)?),
        system_prompt: cfg.completion.system_prompt.clone(),
    });
    let app = build_router(state, RouterOptions::from_config(&cfg)?);

    tracing::info!(%addr, "issuepilot serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

pub fn build_router(state: Arc<AppState>, options: RouterOptions) -> Router {
    let mut agent_router = routes::agent::router(options.http_max_in_flight);
    if let Some(policy) = options.signature {
        agent_router = agent_router
            .layer(axum::middleware::from_fn(http_auth::require_signature))
            .layer(Extension(SignaturePolicyExt(policy)));
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::health::router()
        .merge(agent_router)
        .layer(DefaultBodyLimit::max(options.max_body_bytes))
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(options.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            options.http_timeout,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to install SIGTERM handler; falling back to ctrl_c only"
                );
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Collaborators;
    use crate::error::AgentError;
    use crate::request::Credentials;
    use axum::body::{Body, to_bytes};
    use tower::util::ServiceExt;

    struct NoBackends;

    impl Backends for NoBackends {
        fn connect(&self, _credentials: &Credentials) -> Result<Collaborators, AgentError> {
            Err(AgentError::Internal("no backends in this test".to_string()))
        }
    }

    fn test_router() -> Router {
        let state = Arc::new(AppState {
            registry: ToolRegistry::builtin(),
            backends: Arc::new(NoBackends),
            system_prompt: None,
        });
        build_router(
            state,
            RouterOptions {
                http_timeout: Duration::from_secs(5),
                http_max_in_flight: 4,
                max_body_bytes: 64,
                signature: None,
            },
        )
    }

    #[tokio::test]
    async fn request_id_is_generated_and_propagated() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .expect("request id header");
        assert!(!request_id.is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_the_agent_runs() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("authorization", "Bearer tok")
                    .body(Body::from(vec![b'x'; 1024]))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let _ = to_bytes(response.into_body(), usize::MAX).await;
    }

    #[test]
    fn request_id_falls_back_to_missing() {
        assert_eq!(request_id_from_headers(&HeaderMap::new()), "missing");
    }

    #[test]
    fn options_follow_signature_setting() {
        let mut cfg = IssuePilotConfig::default();
        assert!(
            RouterOptions::from_config(&cfg)
                .expect("options")
                .signature
                .is_some()
        );
        cfg.security.verify_signatures = false;
        let options = RouterOptions::from_config(&cfg).expect("options");
        assert!(options.signature.is_none());
        assert_eq!(options.max_body_bytes, 1024 * 1024);
    }
}
