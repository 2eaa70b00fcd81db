//! HTTP clients for the stage services.
//!
//! Every collaborator is a small JSON-over-HTTP service. Status codes are
//! mapped onto [`StageError`] so the coordinator can classify failures:
//! 408, 429 and 5xx are transient, other 4xx are permanent rejections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vsum_models::OutputFormat;

use crate::error::{StageError, StageResult};
use crate::stage::{AccessGate, DeliverySink, Renderer, Resolver, StageSet, Summarizer};
use crate::types::{ArtifactRef, ResolvedVideo, StageContext, StructuredSummary, VideoMetadata};

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Configuration for the stage service clients.
#[derive(Debug, Clone)]
pub struct StageClientConfig {
    /// Transcript/metadata service
    pub resolver_url: String,
    /// AI summarization service
    pub summarizer_url: String,
    /// Document rendering service
    pub renderer_url: String,
    /// Delivery service (chat front end)
    pub delivery_url: String,
    /// Subscription check service; no gate when unset
    pub access_gate_url: Option<String>,
    /// Upper bound for a single HTTP request
    pub timeout: Duration,
    /// Formats the renderer accepts
    pub supported_formats: Vec<OutputFormat>,
}

impl Default for StageClientConfig {
    fn default() -> Self {
        Self {
            resolver_url: "http://localhost:8101".to_string(),
            summarizer_url: "http://localhost:8102".to_string(),
            renderer_url: "http://localhost:8103".to_string(),
            delivery_url: "http://localhost:8104".to_string(),
            access_gate_url: None,
            timeout: Duration::from_secs(120),
            supported_formats: OutputFormat::ALL.to_vec(),
        }
    }
}

impl StageClientConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            resolver_url: std::env::var("RESOLVER_URL").unwrap_or(defaults.resolver_url),
            summarizer_url: std::env::var("SUMMARIZER_URL").unwrap_or(defaults.summarizer_url),
            renderer_url: std::env::var("RENDERER_URL").unwrap_or(defaults.renderer_url),
            delivery_url: std::env::var("DELIVERY_URL").unwrap_or(defaults.delivery_url),
            access_gate_url: std::env::var("ACCESS_GATE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            timeout: Duration::from_secs(
                std::env::var("STAGE_HTTP_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            ),
            supported_formats: std::env::var("SUPPORTED_FORMATS")
                .map(|raw| OutputFormat::parse_list(&raw))
                .unwrap_or(defaults.supported_formats),
        }
    }
}

/// Shared JSON transport for one service.
#[derive(Debug, Clone)]
struct ServiceClient {
    http: Client,
    base_url: String,
    service: &'static str,
}

impl ServiceClient {
    fn new(http: Client, base_url: &str, service: &'static str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            service,
        }
    }

    /// POST `body` to `path`, bounded by the stage deadline when one is given.
    async fn post<B, R>(&self, ctx: Option<&StageContext>, path: &str, body: &B) -> StageResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let bytes = self.send(ctx, path, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StageError::invalid_response(format!("{} returned malformed JSON: {}", self.service, e))
        })
    }

    async fn send<B>(&self, ctx: Option<&StageContext>, path: &str, body: &B) -> StageResult<Vec<u8>>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body);
        if let Some(ctx) = ctx {
            let remaining = ctx.remaining();
            if remaining.is_zero() {
                return Err(StageError::Timeout(Duration::ZERO));
            }
            request = request.timeout(remaining);
        }

        debug!(service = self.service, url = %url, "Calling stage service");
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if status.is_success() {
            return Ok(bytes.to_vec());
        }

        let detail = error_detail(&bytes);
        warn!(service = self.service, status = %status, detail = %detail, "Stage service error");
        let message = format!("{} returned {}: {}", self.service, status, detail);
        if is_transient_status(status) {
            Err(StageError::ServiceUnavailable(message))
        } else {
            Err(StageError::Rejected(message))
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Pull `error`/`detail` out of a JSON error body, else use the raw text.
fn error_detail(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<String>,
        detail: Option<String>,
    }

    let text = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { error: Some(msg), .. }) | Ok(ErrorBody { detail: Some(msg), .. }) => msg,
        _ => String::from_utf8_lossy(body).into_owned(),
    };
    let mut text = text.trim().to_string();
    if text.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

fn build_http(timeout: Duration) -> StageResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(StageError::Network)
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    transcript: &'a str,
    metadata: &'a VideoMetadata,
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    job_id: &'a str,
    summary: &'a StructuredSummary,
    format: OutputFormat,
}

#[derive(Deserialize)]
struct RenderResponse {
    artifact: ArtifactRef,
}

#[derive(Serialize)]
struct DeliverRequest<'a> {
    job_id: &'a str,
    user_id: &'a str,
    artifact: &'a ArtifactRef,
}

#[derive(Serialize)]
struct AccessRequest<'a> {
    user_id: &'a str,
}

#[derive(Deserialize)]
struct AccessResponse {
    allowed: bool,
}

impl StageSet {
    /// HTTP-backed collaborators for every stage.
    pub fn http(config: &StageClientConfig) -> StageResult<Self> {
        Ok(Self {
            resolver: Arc::new(HttpResolver::new(config)?),
            summarizer: Arc::new(HttpSummarizer::new(config)?),
            renderer: Arc::new(HttpRenderer::new(config)?),
            delivery: Arc::new(HttpDelivery::new(config)?),
        })
    }
}

/// `POST {resolver}/resolve`
#[derive(Debug, Clone)]
pub struct HttpResolver(ServiceClient);

impl HttpResolver {
    pub fn new(config: &StageClientConfig) -> StageResult<Self> {
        let http = build_http(config.timeout)?;
        Ok(Self(ServiceClient::new(http, &config.resolver_url, "resolver")))
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, ctx: &StageContext, reference: &str) -> StageResult<ResolvedVideo> {
        let resolved: ResolvedVideo = self
            .0
            .post(Some(ctx), "/resolve", &ResolveRequest { url: reference })
            .await?;
        if resolved.transcript.trim().is_empty() {
            return Err(StageError::rejected("video has no usable transcript"));
        }
        Ok(resolved)
    }
}

/// `POST {summarizer}/summarize`
#[derive(Debug, Clone)]
pub struct HttpSummarizer(ServiceClient);

impl HttpSummarizer {
    pub fn new(config: &StageClientConfig) -> StageResult<Self> {
        let http = build_http(config.timeout)?;
        Ok(Self(ServiceClient::new(http, &config.summarizer_url, "summarizer")))
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(
        &self,
        ctx: &StageContext,
        transcript: &str,
        metadata: &VideoMetadata,
    ) -> StageResult<StructuredSummary> {
        self.0
            .post(Some(ctx), "/summarize", &SummarizeRequest { transcript, metadata })
            .await
    }
}

/// `POST {renderer}/render`
#[derive(Debug, Clone)]
pub struct HttpRenderer(ServiceClient);

impl HttpRenderer {
    pub fn new(config: &StageClientConfig) -> StageResult<Self> {
        let http = build_http(config.timeout)?;
        Ok(Self(ServiceClient::new(http, &config.renderer_url, "renderer")))
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(
        &self,
        ctx: &StageContext,
        summary: &StructuredSummary,
        format: OutputFormat,
    ) -> StageResult<ArtifactRef> {
        let request = RenderRequest {
            job_id: ctx.job_id.as_str(),
            summary,
            format,
        };
        let response: RenderResponse = self.0.post(Some(ctx), "/render", &request).await?;
        if response.artifact.as_str().is_empty() {
            return Err(StageError::invalid_response("renderer returned an empty artifact reference"));
        }
        Ok(response.artifact)
    }
}

/// `POST {delivery}/deliver`
#[derive(Debug, Clone)]
pub struct HttpDelivery(ServiceClient);

impl HttpDelivery {
    pub fn new(config: &StageClientConfig) -> StageResult<Self> {
        let http = build_http(config.timeout)?;
        Ok(Self(ServiceClient::new(http, &config.delivery_url, "delivery")))
    }
}

#[async_trait]
impl DeliverySink for HttpDelivery {
    async fn deliver(&self, ctx: &StageContext, user_id: &str, artifact: &ArtifactRef) -> StageResult<()> {
        let request = DeliverRequest {
            job_id: ctx.job_id.as_str(),
            user_id,
            artifact,
        };
        self.0.send(Some(ctx), "/deliver", &request).await?;
        Ok(())
    }
}

/// `POST {gate}/access`
#[derive(Debug, Clone)]
pub struct HttpAccessGate(ServiceClient);

impl HttpAccessGate {
    pub fn new(base_url: &str, timeout: Duration) -> StageResult<Self> {
        let http = build_http(timeout)?;
        Ok(Self(ServiceClient::new(http, base_url, "access_gate")))
    }

    /// Gate configured by `ACCESS_GATE_URL`, if any.
    pub fn from_config(config: &StageClientConfig) -> StageResult<Option<Arc<dyn AccessGate>>> {
        match &config.access_gate_url {
            Some(url) => Ok(Some(Arc::new(Self::new(url, config.timeout)?))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AccessGate for HttpAccessGate {
    async fn allows(&self, user_id: &str) -> StageResult<bool> {
        let response: AccessResponse = self.0.post(None, "/access", &AccessRequest { user_id }).await?;
        Ok(response.allowed)
    }
}
