//! Upstream dispatch with transparent dual-key failover.
//!
//! The dispatcher owns the per-provider protocol choreography: it builds the
//! provider-native body, attaches credentials, and maps upstream failures to
//! typed [`ProxyError`]s. For the Anthropic family it additionally resolves a
//! (primary, fallback) key plan from [`DualKeyState`] and retries exactly
//! once on 429/401, marking the failing key type cooling for 60 seconds.
//! Every other provider gets a single attempt; a 429 puts the model itself
//! on cooldown so the router avoids it.

use std::sync::Arc;
use std::time::Instant;

use crate::{
    catalog::Provider,
    config::Config,
    error::ProxyError,
    ingress::{ControlHeaders, ParsedRequest},
    providers::{
        estimate_tokens, stream_family, AnthropicAuth, AnthropicClient, GoogleClient,
        OpenAICompatClient, ProxyResponse, SseStream, UpstreamError,
    },
    rate_limit::{DualKeyState, KeyType, RateLimiter, KEY_COOLDOWN, MODEL_COOLDOWN},
    router::RoutingDecision,
    sse::UpstreamFamily,
};

/// A started upstream stream, plus the dispatch metadata the mediator logs.
pub struct DispatchedStream {
    pub stream: SseStream,
    pub family: UpstreamFamily,
    pub key_type: Option<KeyType>,
    pub failover: bool,
}

#[derive(Debug)]
pub struct Dispatcher {
    config: Arc<Config>,
    dual_key: Arc<DualKeyState>,
    rate_limiter: Arc<RateLimiter>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        dual_key: Arc<DualKeyState>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config,
            dual_key,
            rate_limiter,
        }
    }

    /// Forward a non-streaming request and decode the neutral response.
    pub async fn dispatch(
        &self,
        decision: &RoutingDecision,
        parsed: &ParsedRequest,
        control: &ControlHeaders,
    ) -> Result<ProxyResponse, ProxyError> {
        let model = &decision.model_id;
        let started = Instant::now();

        let (content, mut input_tokens, mut output_tokens, finish_reason, key_type, failover) =
            match decision.provider {
                Provider::Anthropic => {
                    let body = AnthropicClient::build_body(parsed, model, false);
                    let (value, key_type, failover) = self
                        .anthropic_attempts(model, control, |client, auth| {
                            let body = body.clone();
                            async move { client.send(&body, &auth).await }
                        })
                        .await?;
                    let (content, input, output, finish) = AnthropicClient::parse_response(&value)
                        .map_err(|e| self.surface(Provider::Anthropic, model, e))?;
                    (content, input, output, finish, Some(key_type), failover)
                }
                Provider::Google => {
                    let client = GoogleClient::new(
                        self.config.base_url(Provider::Google),
                        self.api_key(Provider::Google),
                    );
                    let body = GoogleClient::build_body(parsed);
                    let value = client
                        .send(model, &body)
                        .await
                        .map_err(|e| self.surface(Provider::Google, model, e))?;
                    let (content, input, output, finish) = GoogleClient::parse_response(&value)
                        .map_err(|e| self.surface(Provider::Google, model, e))?;
                    (content, input, output, finish, None, false)
                }
                provider => {
                    let client = OpenAICompatClient::new(
                        self.config.base_url(provider),
                        Some(&self.api_key(provider)),
                    );
                    let body = OpenAICompatClient::build_body(parsed, model, false);
                    let value = client
                        .send(&body)
                        .await
                        .map_err(|e| self.surface(provider, model, e))?;
                    let (content, input, output, finish) =
                        OpenAICompatClient::parse_response(&value)
                            .map_err(|e| self.surface(provider, model, e))?;
                    (content, input, output, finish, None, false)
                }
            };

        // Some OpenAI-compatible backends omit usage; estimate locally so
        // cost reporting never reads zero for a real response.
        if input_tokens == 0 {
            input_tokens = estimate_request_tokens(parsed);
        }
        if output_tokens == 0 && !content.is_empty() {
            output_tokens = estimate_tokens(&content);
        }

        Ok(ProxyResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
            model_id: model.clone(),
            provider: decision.provider,
            latency_ms: started.elapsed().as_millis() as u64,
            key_type,
            failover,
        })
    }

    /// Open a streaming upstream request. Failover happens here too: a
    /// 429/401 arrives as the response status, before any body bytes.
    pub async fn dispatch_stream(
        &self,
        decision: &RoutingDecision,
        parsed: &ParsedRequest,
        control: &ControlHeaders,
    ) -> Result<DispatchedStream, ProxyError> {
        let model = &decision.model_id;
        let family = stream_family(decision.provider);

        let (stream, key_type, failover) = match decision.provider {
            Provider::Anthropic => {
                let body = AnthropicClient::build_body(parsed, model, true);
                let (stream, key_type, failover) = self
                    .anthropic_attempts(model, control, |client, auth| {
                        let body = body.clone();
                        async move { client.send_stream(&body, &auth).await }
                    })
                    .await?;
                (stream, Some(key_type), failover)
            }
            Provider::Google => {
                let client = GoogleClient::new(
                    self.config.base_url(Provider::Google),
                    self.api_key(Provider::Google),
                );
                let body = GoogleClient::build_body(parsed);
                let stream = client
                    .send_stream(model, &body)
                    .await
                    .map_err(|e| self.surface(Provider::Google, model, e))?;
                (stream, None, false)
            }
            provider => {
                let client = OpenAICompatClient::new(
                    self.config.base_url(provider),
                    Some(&self.api_key(provider)),
                );
                let body = OpenAICompatClient::build_body(parsed, model, true);
                let stream = client
                    .send_stream(&body)
                    .await
                    .map_err(|e| self.surface(provider, model, e))?;
                (stream, None, false)
            }
        };

        Ok(DispatchedStream {
            stream,
            family,
            key_type,
            failover,
        })
    }

    /// Run the dual-key attempt sequence for one Anthropic request.
    async fn anthropic_attempts<T, F, Fut>(
        &self,
        model: &str,
        control: &ControlHeaders,
        attempt: F,
    ) -> Result<(T, KeyType, bool), ProxyError>
    where
        F: Fn(Arc<AnthropicClient>, AnthropicAuth) -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        let settings = self
            .config
            .provider(Provider::Anthropic)
            .ok_or(ProxyError::NoAvailableModel)?
            .clone();
        let setup_token = settings
            .setup_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(String::from);
        let enterprise_key =
            (!settings.api_key.is_empty()).then(|| settings.api_key.clone());

        let plan = self
            .dual_key
            .plan(setup_token.is_some(), enterprise_key.is_some())
            .ok_or(ProxyError::NoAvailableModel)?;

        let client = Arc::new(AnthropicClient::new(self.config.base_url(Provider::Anthropic)));
        let auth_for = |kt: KeyType| AnthropicAuth {
            key: match kt {
                KeyType::SetupToken => setup_token.clone().unwrap_or_default(),
                KeyType::Enterprise => enterprise_key.clone().unwrap_or_default(),
            },
            auth_type: settings.auth_type,
            version: control.anthropic_version.clone(),
            beta: control.anthropic_beta.clone(),
        };

        match attempt(client.clone(), auth_for(plan.primary)).await {
            Ok(value) => Ok((value, plan.primary, false)),
            Err(err) => {
                let retriable = matches!(err.status(), Some(429) | Some(401));
                if retriable {
                    self.dual_key.mark_cooling(plan.primary, KEY_COOLDOWN);
                }
                match plan.fallback {
                    Some(fallback) if retriable => {
                        tracing::warn!(
                            model,
                            primary = %plan.primary,
                            fallback = %fallback,
                            status = ?err.status(),
                            error = err.body(),
                            "anthropic key failover"
                        );
                        match attempt(client, auth_for(fallback)).await {
                            Ok(value) => Ok((value, fallback, true)),
                            Err(second) => {
                                if matches!(second.status(), Some(429) | Some(401)) {
                                    self.dual_key.mark_cooling(fallback, KEY_COOLDOWN);
                                }
                                Err(self.surface(Provider::Anthropic, model, second))
                            }
                        }
                    }
                    _ => Err(self.surface(Provider::Anthropic, model, err)),
                }
            }
        }
    }

    fn api_key(&self, provider: Provider) -> String {
        self.config
            .provider(provider)
            .map(|s| s.api_key.clone())
            .unwrap_or_default()
    }

    /// Map an exhausted upstream failure to the client-facing error. A final
    /// 429 also puts the model on cooldown so the router steers around it.
    fn surface(&self, provider: Provider, model: &str, err: UpstreamError) -> ProxyError {
        match err {
            UpstreamError::Http { status: 429, body } => {
                self.rate_limiter.mark_rate_limited(model, MODEL_COOLDOWN);
                ProxyError::UpstreamRateLimited { provider, body }
            }
            UpstreamError::Http { status: 401, body } => {
                ProxyError::UpstreamAuthFailed { provider, body }
            }
            UpstreamError::Http { status, body } => ProxyError::Upstream {
                provider,
                status,
                body,
            },
            UpstreamError::Network(msg) => ProxyError::Upstream {
                provider,
                status: 502,
                body: msg,
            },
        }
    }
}

/// Estimate the input side of a request locally (system + all messages).
fn estimate_request_tokens(parsed: &ParsedRequest) -> u64 {
    let mut total = parsed
        .system
        .as_deref()
        .map(estimate_tokens)
        .unwrap_or(0);
    for message in &parsed.messages {
        total += estimate_tokens(&message.content);
    }
    total
}
