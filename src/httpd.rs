// outpost: HTTP daemon - mux of built-in endpoints over the command pipeline

use crate::error::{OutpostError, OutpostResult};
use crate::feature::FeatureSet;
use crate::handlers;
use crate::mailer::Mailer;
use crate::pipeline::CommandPipeline;
use crate::ratelimit::RateLimiter;
use crate::ringlog::DaemonLogger;
use crate::supervisor::SharedState;
use crate::twilio;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;

/// Upper bound on command execution for the HTTP front
pub const HTTP_COMMAND_TIMEOUT_SEC: u64 = 120;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HttpDaemonConfig {
    #[serde(rename = "ListenAddress", default)]
    pub listen_address: String,
    #[serde(rename = "ListenPort", default)]
    pub listen_port: u16,
    #[serde(rename = "BaseRateLimit", default)]
    pub base_rate_limit: u32,
    /// URL prefix to filesystem path
    #[serde(rename = "ServeDirectories", default)]
    pub serve_directories: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IndexEndpointConfig {
    #[serde(rename = "HTMLFilePath", default)]
    pub html_file_path: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MailMeEndpointConfig {
    #[serde(rename = "Recipients", default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TwilioCallEndpointConfig {
    #[serde(rename = "CallGreeting", default)]
    pub call_greeting: String,
}

/// Endpoint-path to endpoint-type wiring for the HTTP daemon.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HttpHandlersConfig {
    #[serde(rename = "IndexEndpoints", default)]
    pub index_endpoints: Vec<String>,
    #[serde(rename = "IndexEndpointConfig", default)]
    pub index_endpoint_config: IndexEndpointConfig,
    #[serde(rename = "CommandFormEndpoint", default)]
    pub command_form_endpoint: String,
    #[serde(rename = "MailMeEndpoint", default)]
    pub mail_me_endpoint: String,
    #[serde(rename = "MailMeEndpointConfig", default)]
    pub mail_me_endpoint_config: MailMeEndpointConfig,
    #[serde(rename = "WebProxyEndpoint", default)]
    pub web_proxy_endpoint: String,
    #[serde(rename = "SelfTestEndpoint", default)]
    pub self_test_endpoint: String,
    #[serde(rename = "InformationEndpoint", default)]
    pub information_endpoint: String,
    #[serde(rename = "TwilioSMSEndpoint", default)]
    pub twilio_sms_endpoint: String,
    #[serde(rename = "TwilioCallEndpoint", default)]
    pub twilio_call_endpoint: String,
    #[serde(rename = "TwilioCallEndpointConfig", default)]
    pub twilio_call_endpoint_config: TwilioCallEndpointConfig,
}

impl HttpHandlersConfig {
    fn needs_pipeline(&self) -> bool {
        !self.command_form_endpoint.is_empty()
            || !self.twilio_sms_endpoint.is_empty()
            || !self.twilio_call_endpoint.is_empty()
    }
}

/// State shared by every handler.
pub struct HttpShared {
    pub pipeline: Option<Arc<CommandPipeline>>,
    pub features: Arc<FeatureSet>,
    pub mailer: Mailer,
    pub handlers: HttpHandlersConfig,
    pub rate_limit: Arc<RateLimiter>,
    pub twilio_callback_path: String,
    pub started_at: Instant,
    pub http_client: reqwest::Client,
    pub logger: DaemonLogger,
}

pub type HttpState = Arc<HttpShared>;

/// HTTP front. Every endpoint sits behind the per-IP rate limit; handler
/// panics become 500 responses; unknown paths 404 without logging.
pub struct HttpDaemon {
    config: HttpDaemonConfig,
    state: HttpState,
    shared: SharedState,
    logger: DaemonLogger,
}

impl HttpDaemon {
    pub fn new(
        config: HttpDaemonConfig,
        handlers_config: HttpHandlersConfig,
        pipeline: Option<Arc<CommandPipeline>>,
        features: Arc<FeatureSet>,
        mailer: Mailer,
        shared: SharedState,
    ) -> OutpostResult<Self> {
        if handlers_config.needs_pipeline() && pipeline.is_none() {
            return Err(OutpostError::ConfigError(
                "HTTPHandlers has command endpoints but HTTPBridges is absent".to_string(),
            ));
        }
        let logger = DaemonLogger::new(
            "HTTPD",
            format!("{}:{}", config.listen_address, config.listen_port),
            shared.logs.clone(),
        );
        let rate_limit = Arc::new(RateLimiter::new(config.base_rate_limit, logger.clone()));
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(25))
            .build()
            .map_err(|err| OutpostError::ConfigError(err.to_string()))?;
        let state = Arc::new(HttpShared {
            pipeline,
            features,
            mailer,
            handlers: handlers_config,
            rate_limit,
            twilio_callback_path: twilio::random_callback_path(),
            started_at: Instant::now(),
            http_client,
            logger: logger.clone(),
        });
        Ok(Self {
            config,
            state,
            shared,
            logger,
        })
    }

    /// The randomly generated path where the Twilio call callback is
    /// mounted; only observable via the call-hook response.
    pub fn twilio_callback_path(&self) -> &str {
        &self.state.twilio_callback_path
    }

    fn build_router(&self) -> Router {
        let mut router = Router::new();
        let endpoints = &self.state.handlers;
        for endpoint in &endpoints.index_endpoints {
            router = router.route(endpoint, get(handlers::handle_index));
        }
        for (url_prefix, fs_path) in &self.config.serve_directories {
            router = handlers::directory_routes(router, url_prefix, fs_path);
        }
        if !endpoints.command_form_endpoint.is_empty() {
            router = router.route(
                &endpoints.command_form_endpoint,
                get(handlers::handle_command_form).post(handlers::handle_command_form_submit),
            );
        }
        if !endpoints.mail_me_endpoint.is_empty() {
            router = router.route(
                &endpoints.mail_me_endpoint,
                get(handlers::handle_mail_me).post(handlers::handle_mail_me_submit),
            );
        }
        if !endpoints.web_proxy_endpoint.is_empty() {
            router = router.route(&endpoints.web_proxy_endpoint, get(handlers::handle_web_proxy));
        }
        if !endpoints.self_test_endpoint.is_empty() {
            router = router.route(&endpoints.self_test_endpoint, get(handlers::handle_self_test));
        }
        if !endpoints.information_endpoint.is_empty() {
            router = router.route(&endpoints.information_endpoint, get(handlers::handle_info));
        }
        if !endpoints.twilio_sms_endpoint.is_empty() {
            router = router.route(
                &endpoints.twilio_sms_endpoint,
                axum::routing::post(twilio::handle_sms_hook),
            );
        }
        if !endpoints.twilio_call_endpoint.is_empty() {
            router = router
                .route(&endpoints.twilio_call_endpoint, get(twilio::handle_call_hook))
                .route(
                    &self.state.twilio_callback_path,
                    axum::routing::post(twilio::handle_call_callback),
                );
        }
        router
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                rate_limit_middleware,
            ))
            .layer(CatchPanicLayer::new())
            .with_state(self.state.clone())
    }

    /// Serve until shutdown, lockdown or a listener error.
    pub async fn start_and_block(&self) -> OutpostResult<()> {
        let listen_addr = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let listener = tokio::net::TcpListener::bind(&listen_addr)
            .await
            .map_err(|err| {
                OutpostError::NetworkError(format!("failed to listen on {} - {}", listen_addr, err))
            })?;
        self.logger.info("start_and_block", &listen_addr, "going to serve requests");
        let router = self.build_router();
        let shared = self.shared.clone();
        let mut shutdown = shared.subscribe_shutdown();
        let stop_signal = async move {
            loop {
                if shared.is_locked_down() {
                    return;
                }
                if tokio::time::timeout(Duration::from_millis(250), shutdown.changed())
                    .await
                    .is_ok()
                {
                    return;
                }
            }
        };
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stop_signal)
        .await
        .map_err(|err| OutpostError::NetworkError(err.to_string()))?;
        if self.shared.is_locked_down() {
            return Err(OutpostError::EmergencyLockDown);
        }
        Ok(())
    }
}

/// The rate-limit check runs before any handler dispatch.
async fn rate_limit_middleware(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !state.rate_limit.add(&addr.ip().to_string(), true) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    next.run(request).await
}
