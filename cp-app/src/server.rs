//! ChatPilot server.
//!
//! Wires the bridge surface and the LLM reply generator into the engine,
//! then serves the control API until ctrl-c / SIGTERM.

use crate::assistant::LlmReplyGenerator;
use crate::config::{ChatPilotConfig, ControlConfig};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use cp_channels::{ChatSurface, ConversationId, HttpBridgeSurface};
use cp_engine::Engine;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub started_at: Instant,
    pub model: String,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ChatPilotConfig::load_with_path(config_path).await?;
    LlmReplyGenerator::from_config(&cfg)?;
    let bridge = build_bridge(&cfg)?;
    let health = bridge
        .health()
        .await
        .map_err(|e| anyhow::anyhow!("bridge {} unreachable: {e}", bridge.base_url()))?;
    tracing::info!(
        model = %cfg.general.model,
        bridge = %bridge.base_url(),
        bridge_health = %health,
        listen_targets = cfg.listen.len(),
        control_enabled = cfg.control.enabled,
        config_path = %path.display(),
        "config ok"
    );
    println!("chatpilot doctor: ok ({})", path.display());
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    conversation: &str,
    message: &str,
) -> Result<()> {
    let cfg = ChatPilotConfig::load(config_path).await?;
    let bridge = build_bridge(&cfg)?;
    let conversation = ConversationId::from(conversation.trim());
    bridge.acquire(&conversation).await?;
    bridge.send_text(&conversation, message).await?;
    tracing::info!(conversation = %conversation, "one-shot message sent");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = ChatPilotConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let engine_cfg = cfg.engine_config();
    tracing::info!(
        config_path = %cfg_path.display(),
        model = %cfg.general.model,
        bridge = %cfg.bridge.base_url,
        poll_interval_ms = engine_cfg.poll_interval.as_millis() as u64,
        quiet_period_ms = engine_cfg.quiet_period.as_millis() as u64,
        queue_capacity = engine_cfg.queue_capacity,
        dedup_capacity = engine_cfg.dedup_capacity,
        history_exchanges = engine_cfg.history_exchanges,
        listen_targets = cfg.listen.len(),
        control_enabled = cfg.control.enabled,
        control_bind_addr = %cfg.control.bind_addr,
        "server configuration loaded"
    );

    // Bind before starting the engine so a taken port fails fast.
    let listener = if cfg.control.enabled {
        Some(preflight_bind_listener(cfg.control_addr()?).await?)
    } else {
        None
    };

    let surface: Arc<dyn ChatSurface> = Arc::new(build_bridge(&cfg)?);
    let generator = Arc::new(LlmReplyGenerator::from_config(&cfg)?);
    let engine = Arc::new(Engine::start(engine_cfg, surface, generator)?);

    for (conversation, flags) in cfg.listen_targets() {
        match engine.add_listen_target(&conversation, flags).await {
            Ok(()) => tracing::info!(conversation = %conversation, ?flags, "listen target registered"),
            Err(e) => tracing::error!(
                conversation = %conversation,
                error = %e,
                "could not start listening; continuing without it"
            ),
        }
    }

    let shutdown = CancellationToken::new();
    match listener {
        Some(listener) => {
            let state = Arc::new(AppState {
                engine: engine.clone(),
                started_at,
                model: cfg.general.model.clone(),
            });
            let app = build_router(state, &cfg.control);
            tracing::info!(addr = %cfg.control.bind_addr, "chatpilot control api serving");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
                .await?;
            tracing::info!("http server shutdown completed");
        }
        None => {
            tracing::info!("control api disabled; running until signalled");
            shutdown_signal(shutdown.clone()).await;
        }
    }

    engine.shutdown().await;
    Ok(())
}

pub fn build_router(state: Arc<AppState>, control: &ControlConfig) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri(),
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

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(control.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(control.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn build_bridge(cfg: &ChatPilotConfig) -> Result<HttpBridgeSurface> {
    Ok(HttpBridgeSurface::new(&cfg.bridge.base_url)?
        .with_auth_token(cfg.bridge.auth_token.clone())
        .with_request_timeout(Duration::from_millis(cfg.bridge.request_timeout_ms))?)
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
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

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
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
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{FixtureSurface, app_state, call};

    #[test]
    fn request_id_defaults_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc".parse().expect("header value"));
        assert_eq!(request_id_from_headers(&headers), "abc");
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let state = app_state(Arc::new(FixtureSurface::default()));
        let (code, _) = call(&state, "GET", "/nope", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        state.engine.shutdown().await;
    }

    #[test]
    fn bridge_is_built_from_config() {
        let raw = r#"
[general]
model = "gpt-4o-mini"
[keys]
openai_api_key = "sk-test"
[bridge]
base_url = "http://127.0.0.1:8765/api"
auth_token = "t"
"#;
        let cfg = ChatPilotConfig::parse(raw).expect("parse");
        let bridge = build_bridge(&cfg).expect("bridge");
        assert_eq!(bridge.base_url(), "http://127.0.0.1:8765/api");

        let mut bad = cfg.clone();
        bad.bridge.base_url = "ftp://nope".to_string();
        assert!(build_bridge(&bad).is_err());
    }
}
