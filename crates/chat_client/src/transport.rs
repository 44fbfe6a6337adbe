use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chat_core::{NetConfig, TokenProvider};
use http::Extensions;
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use tokio_util::sync::CancellationToken;

use crate::endpoints::EndpointPolicy;
use crate::error::{NetError, Result};
use crate::models::{ApiRequest, ApiResponse};

/// Anything that can perform one request and hand back its response.
///
/// Implemented by [`HttpTransport`] (single attempt) and by
/// [`crate::RequestDispatcher`] (retries and offline handoff).
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// Marker extension: the request must go out without a bearer token.
#[derive(Debug, Clone, Copy)]
struct SkipAuth;

/// Injects `Authorization: Bearer <token>` on every request not marked [`SkipAuth`].
struct AuthMiddleware {
    tokens: Arc<dyn TokenProvider>,
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        if extensions.get::<SkipAuth>().is_none() && !req.headers().contains_key(AUTHORIZATION) {
            match self.tokens.get_token().await {
                Some(token) => match HeaderValue::from_str(&format!("Bearer {token}")) {
                    Ok(value) => {
                        req.headers_mut().insert(AUTHORIZATION, value);
                    }
                    Err(err) => warn!("Dropping unusable bearer token: {err}"),
                },
                None => debug!("No token available for {}", req.url()),
            }
        }
        next.run(req, extensions).await
    }
}

/// The HTTP client shared by every component of the layer.
pub struct HttpTransport {
    client: ClientWithMiddleware,
    config: Arc<NetConfig>,
    policy: EndpointPolicy,
}

impl HttpTransport {
    pub fn new(config: Arc<NetConfig>, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .default_headers(Self::default_headers())
            .build()
            .map_err(|e| NetError::Network(format!("Failed to build HTTP client: {e}")))?;
        let client = ClientBuilder::new(client)
            .with(AuthMiddleware { tokens })
            .build();
        let policy = EndpointPolicy::new(config.endpoints.clone());
        Ok(Self {
            client,
            config,
            policy,
        })
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(concat!("chat-net/", env!("CARGO_PKG_VERSION"))),
        );
        headers
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn policy(&self) -> &EndpointPolicy {
        &self.policy
    }

    /// Timeout budget for an endpoint: chat-class calls get the wider one.
    pub fn timeout_for(&self, endpoint: &str) -> Duration {
        if self.policy.is_chat(endpoint) {
            self.config.chat_timeout()
        } else {
            self.config.request_timeout()
        }
    }

    /// Start a request and return the raw response once headers arrive.
    /// The body is left unread, so streaming callers consume it incrementally.
    pub async fn open(&self, request: &ApiRequest) -> Result<Response> {
        let url = self.config.url_for(&request.endpoint);
        let mut builder = self.client.request(request.method.into(), url.as_str());

        for (name, value) in &request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => warn!("Skipping invalid header {name:?} for {url}"),
            }
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if self.policy.is_auth(&request.endpoint) {
            builder = builder.with_extension(SkipAuth);
        }

        let timeout_ms = self.timeout_for(&request.endpoint).as_millis() as u64;
        info!("Sending {} request to {}", request.method, url);
        let start = Instant::now();
        match builder.send().await {
            Ok(resp) => {
                info!(
                    "Got response from {} after {:?} with status {}",
                    url,
                    start.elapsed(),
                    resp.status()
                );
                Ok(resp)
            }
            Err(e) => {
                error!("Failed HTTP request to {}: {}", url, e);
                Err(NetError::from_middleware(e, timeout_ms))
            }
        }
    }

    /// One attempt with the endpoint's timeout budget; aborted early when
    /// `cancel` fires. Any HTTP status is returned as `Ok`.
    pub async fn send_once(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let budget = self.timeout_for(&request.endpoint);
        let timeout_ms = budget.as_millis() as u64;

        let exchange = async {
            let response = self.open(request).await?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| NetError::from_reqwest(e, timeout_ms))?;
            Ok::<_, NetError>(ApiResponse::from_body(status, &body))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(NetError::Cancelled),
            outcome = tokio::time::timeout(budget, exchange) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!("{} {} timed out after {}ms", request.method, request.endpoint, timeout_ms);
                    Err(NetError::Timeout { after_ms: timeout_ms })
                }
            },
        }
    }
}

#[async_trait]
impl RequestSender for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.send_once(&request, &CancellationToken::new()).await
    }
}
