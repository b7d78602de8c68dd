use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::Outcome;
use crate::attempt::AttemptContext;
use crate::build::build_wire_request;
use crate::classify::{
    ErrorClassifier, StandardErrorClassifier, classify_response, classify_transport_error,
};
use crate::clock_skew::{ClockSkewCorrector, ClockSkewState};
use crate::config::{ClientDefaults, ClientProfile, RetryConfig};
use crate::error::{ErrorKind, SdkError};
use crate::extensions::{Clock, EndpointResolver, StaticEndpoint, SystemClock};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::observe::{NoopObserver, Observer, RequestSummary};
use crate::request::ServiceRequest;
use crate::retry::{RetryMode, RetryQuota, RetryStrategy, RetryVerdict, strategy_for_mode};
use crate::signer::{NullSigner, RequestSigner, SignerRegistry};
use crate::transport::{HyperTransport, HyperTransportOptions, Transport, WireResponse};
use crate::util::{
    bounded_retry_delay, parse_header_name, parse_header_value, phase_timeout,
    redact_uri_for_logs,
};

const DEFAULT_CLIENT_NAME: &str = "reqcore";

/// Where a logical request currently is. Logged on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    Building,
    Signing,
    Sending,
    Interpreting,
    Retrying,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Signing => "signing",
            Self::Sending => "sending",
            Self::Interpreting => "interpreting",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

fn enter_state(state: ExecutionState) {
    debug!(state = state.as_str(), "execution state");
}

enum AttemptStep {
    Finished(Outcome<WireResponse>),
    Retry { delay: Duration },
}

pub struct ServiceClientBuilder {
    client_name: String,
    endpoint: Option<Arc<dyn EndpointResolver>>,
    transport: Option<Arc<dyn Transport>>,
    transport_options: HyperTransportOptions,
    default_signer: Option<Arc<dyn RequestSigner>>,
    named_signers: Vec<Arc<dyn RequestSigner>>,
    retry_strategy: Option<Arc<dyn RetryStrategy>>,
    retry_config: RetryConfig,
    retry_quota: Option<Arc<RetryQuota>>,
    clock_skew_state: Option<Arc<ClockSkewState>>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
    error_classifier: Arc<dyn ErrorClassifier>,
    defaults: ClientDefaults,
    default_headers: HeaderMap,
    metrics_enabled: bool,
}

impl ServiceClientBuilder {
    pub fn new() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            endpoint: None,
            transport: None,
            transport_options: HyperTransportOptions::default(),
            default_signer: None,
            named_signers: Vec::new(),
            retry_strategy: None,
            retry_config: RetryConfig::default(),
            retry_quota: None,
            clock_skew_state: None,
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
            error_classifier: Arc::new(StandardErrorClassifier::new()),
            defaults: ClientDefaults::default(),
            default_headers: HeaderMap::new(),
            metrics_enabled: false,
        }
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn profile(mut self, profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        self.defaults = self
            .defaults
            .with_request_timeout(defaults.request_timeout)
            .with_total_timeout(defaults.total_timeout);
        self.retry_config = defaults.retry;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(Arc::new(StaticEndpoint::new(endpoint)));
        self
    }

    pub fn endpoint_resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.endpoint = Some(resolver);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Options for the default hyper transport. Ignored when a custom
    /// transport is supplied.
    pub fn transport_options(mut self, options: HyperTransportOptions) -> Self {
        self.transport_options = options;
        self
    }

    pub fn signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.default_signer = Some(signer);
        self
    }

    pub fn named_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.named_signers.push(signer);
        self
    }

    /// Takes precedence over [`retry_mode`](Self::retry_mode) and
    /// [`max_attempts`](Self::max_attempts).
    pub fn retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn retry_mode(mut self, mode: RetryMode) -> Self {
        self.retry_config.mode = mode;
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.retry_config.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Shares a token bucket with other clients. Only used by the standard
    /// retry mode.
    pub fn retry_quota(mut self, quota: Arc<RetryQuota>) -> Self {
        self.retry_quota = Some(quota);
        self
    }

    pub fn clock_skew_state(mut self, state: Arc<ClockSkewState>) -> Self {
        self.clock_skew_state = Some(state);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn error_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.error_classifier = classifier;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.defaults = self.defaults.with_request_timeout(request_timeout);
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.defaults = self
            .defaults
            .with_total_timeout(Some(total_timeout.max(Duration::from_millis(1))));
        self
    }

    pub fn user_agent(mut self, user_agent: HeaderValue) -> Self {
        self.defaults = self.defaults.with_user_agent(user_agent);
        self
    }

    pub fn try_user_agent(self, user_agent: &str) -> Outcome<Self> {
        let value = parse_header_value("user-agent", user_agent)?;
        Ok(self.user_agent(value))
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Outcome<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn clock_skew_threshold(mut self, threshold: Duration) -> Self {
        self.defaults = self.defaults.with_skew_threshold(threshold);
        self
    }

    pub fn clock_skew_adjustment(mut self, enabled: bool) -> Self {
        self.defaults = self.defaults.clock_skew_adjustment(enabled);
        self
    }

    pub fn host_prefix_injection(mut self, enabled: bool) -> Self {
        self.defaults = self.defaults.host_prefix_injection(enabled);
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> Outcome<ServiceClient> {
        let Some(endpoint) = self.endpoint else {
            return Err(SdkError::configuration(
                "no endpoint configured; call endpoint() or endpoint_resolver()",
            ));
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::try_new(self.transport_options)?),
        };

        let default_signer = self
            .default_signer
            .unwrap_or_else(|| Arc::new(NullSigner) as Arc<dyn RequestSigner>);
        let mut signers = SignerRegistry::new(default_signer);
        for signer in self.named_signers {
            signers.register(signer);
        }

        let retry_strategy = match self.retry_strategy {
            Some(strategy) => strategy,
            None => strategy_for_mode(
                self.retry_config.mode,
                self.retry_config.max_attempts,
                self.retry_quota.unwrap_or_default(),
            ),
        };

        let defaults = self.defaults.with_default_headers(self.default_headers);
        let skew_corrector = ClockSkewCorrector::new()
            .threshold(defaults.skew_threshold())
            .enabled(defaults.clock_skew_adjustment_enabled());
        let metrics = if self.metrics_enabled {
            ClientMetrics::enabled()
        } else {
            ClientMetrics::disabled()
        };

        Ok(ServiceClient {
            inner: Arc::new(ClientInner {
                client_name: self.client_name,
                defaults,
                endpoint,
                transport,
                signers,
                retry_strategy,
                clock_skew_state: self.clock_skew_state.unwrap_or_default(),
                skew_corrector,
                clock: self.clock,
                observer: self.observer,
                error_classifier: self.error_classifier,
                metrics,
            }),
        })
    }
}

impl Default for ServiceClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientInner {
    client_name: String,
    defaults: ClientDefaults,
    endpoint: Arc<dyn EndpointResolver>,
    transport: Arc<dyn Transport>,
    signers: SignerRegistry,
    retry_strategy: Arc<dyn RetryStrategy>,
    clock_skew_state: Arc<ClockSkewState>,
    skew_corrector: ClockSkewCorrector,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn Observer>,
    error_classifier: Arc<dyn ErrorClassifier>,
    metrics: ClientMetrics,
}

/// Executes [`ServiceRequest`]s: build, sign, send, classify and retry.
///
/// Cloning is cheap and clones share the clock-skew state, the retry quota
/// and the metrics.
#[derive(Clone)]
pub struct ServiceClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ServiceClient")
            .field("client_name", &self.inner.client_name)
            .field("defaults", &self.inner.defaults)
            .field("signers", &self.inner.signers)
            .field("max_attempts", &self.inner.retry_strategy.max_attempts())
            .finish_non_exhaustive()
    }
}

impl ServiceClient {
    pub fn builder() -> ServiceClientBuilder {
        ServiceClientBuilder::new()
    }

    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    pub fn defaults(&self) -> &ClientDefaults {
        &self.inner.defaults
    }

    pub fn clock_skew_state(&self) -> &Arc<ClockSkewState> {
        &self.inner.clock_skew_state
    }

    pub fn retry_strategy(&self) -> &Arc<dyn RetryStrategy> {
        &self.inner.retry_strategy
    }

    pub fn retry_quota(&self) -> Option<&Arc<RetryQuota>> {
        self.inner.retry_strategy.quota()
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub async fn execute(&self, request: &ServiceRequest) -> Outcome<WireResponse> {
        self.execute_with_cancellation(request, &CancellationToken::new())
            .await
    }

    pub async fn execute_json<T>(&self, request: &ServiceRequest) -> Outcome<T>
    where
        T: DeserializeOwned,
    {
        self.execute(request).await?.json()
    }

    /// Like [`execute`](Self::execute), but stops with
    /// [`ErrorKind::Cancelled`] as soon as `cancel` fires, aborting any
    /// in-flight send or backoff sleep.
    pub async fn execute_with_cancellation(
        &self,
        request: &ServiceRequest,
        cancel: &CancellationToken,
    ) -> Outcome<WireResponse> {
        let inner = &self.inner;
        inner.metrics.record_request_started();
        let _in_flight = inner.metrics.enter_in_flight();
        let started = Instant::now();
        let mut context = AttemptContext::new(inner.retry_strategy.max_attempts());

        let result = self.run(request, &mut context, cancel, started).await;
        let result = result.map_err(|error| error.or_attempts(context.attempt()));

        let summary = match &result {
            Ok(response) => {
                inner.metrics.record_request_succeeded(started.elapsed());
                RequestSummary {
                    attempts: context.attempt(),
                    status: Some(response.status()),
                    error_kind: None,
                    elapsed: started.elapsed(),
                }
            }
            Err(error) => {
                inner.metrics.record_request_failed(error, started.elapsed());
                RequestSummary {
                    attempts: error.attempts(),
                    status: error.http_status(),
                    error_kind: Some(error.kind()),
                    elapsed: started.elapsed(),
                }
            }
        };
        inner
            .observer
            .on_request_finished(request.operation_name(), &summary);
        result
    }

    async fn run(
        &self,
        request: &ServiceRequest,
        context: &mut AttemptContext,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Outcome<WireResponse> {
        let inner = &self.inner;
        let signer = inner.signers.resolve(request.signer_name())?;
        let attempt_timeout = request
            .timeout_override()
            .unwrap_or_else(|| inner.defaults.request_timeout());
        loop {
            let span = info_span!(
                "reqcore.attempt",
                client = %inner.client_name,
                operation = %request.operation_name(),
                invocation_id = %context.invocation_id(),
                attempt = context.attempt(),
                max_attempts = context.max_attempts()
            );
            let step = self
                .attempt_once(
                    request,
                    context,
                    signer.as_ref(),
                    attempt_timeout,
                    cancel,
                    started,
                )
                .instrument(span.clone())
                .await;

            let delay = match step {
                AttemptStep::Finished(result) => return result,
                AttemptStep::Retry { delay } => delay,
            };
            span.in_scope(|| enter_state(ExecutionState::Retrying));
            inner.metrics.record_retry();

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(SdkError::cancelled().with_attempts(context.attempt() - 1));
                    }
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_once(
        &self,
        request: &ServiceRequest,
        context: &mut AttemptContext,
        signer: &dyn RequestSigner,
        attempt_timeout: Duration,
        cancel: &CancellationToken,
        started: Instant,
    ) -> AttemptStep {
        let inner = &self.inner;
        if cancel.is_cancelled() {
            return fail(SdkError::cancelled().with_attempts(context.attempt() - 1));
        }
        context.snapshot_skew(inner.clock_skew_state.offset());
        inner.metrics.record_attempt();
        inner
            .observer
            .on_attempt_start(request.operation_name(), context);

        enter_state(ExecutionState::Building);
        let built = inner
            .endpoint
            .resolve_endpoint(request.operation_name())
            .and_then(|endpoint| build_wire_request(request, &inner.defaults, &endpoint, context));
        let wire = match built {
            Ok(wire) => wire,
            Err(error) => return fail(error),
        };

        enter_state(ExecutionState::Signing);
        let signing_time = context.skew_offset().apply(inner.clock.now());
        let wire = match signer.sign(wire, signing_time) {
            Ok(wire) => wire,
            Err(error) => return fail(error),
        };

        enter_state(ExecutionState::Sending);
        let total_timeout = inner.defaults.total_timeout();
        let Some(send_timeout) = phase_timeout(attempt_timeout, total_timeout, started) else {
            return fail(total_timeout_error(total_timeout));
        };
        debug!(
            method = %wire.method(),
            uri = %redact_uri_for_logs(&wire.uri().to_string()),
            timeout_ms = send_timeout.as_millis() as u64,
            "sending request"
        );
        let sent_at = Instant::now();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return fail(SdkError::cancelled()),
            sent = inner.transport.send(wire, send_timeout) => sent,
        };

        enter_state(ExecutionState::Interpreting);
        let received_at = inner.clock.now();
        let error = match sent {
            Ok(response) => {
                inner.metrics.record_status(response.status());
                debug!(
                    status = response.status().as_u16(),
                    elapsed_ms = sent_at.elapsed().as_millis() as u64,
                    "response received"
                );
                match classify_response(inner.error_classifier.as_ref(), response, received_at) {
                    Ok(response) => {
                        inner
                            .retry_strategy
                            .record_success(context.retried_kind());
                        enter_state(ExecutionState::Succeeded);
                        return AttemptStep::Finished(Ok(response));
                    }
                    Err(error) => error,
                }
            }
            Err(error) => classify_transport_error(error),
        };

        self.handle_failure(
            request,
            context,
            error,
            signing_time,
            received_at,
            attempt_timeout,
            started,
        )
    }

    /// Clock skew first, then the retry strategy.
    #[allow(clippy::too_many_arguments)]
    fn handle_failure(
        &self,
        request: &ServiceRequest,
        context: &mut AttemptContext,
        error: SdkError,
        signing_time: SystemTime,
        received_at: SystemTime,
        attempt_timeout: Duration,
        started: Instant,
    ) -> AttemptStep {
        let inner = &self.inner;
        debug!(
            error_kind = error.kind().as_str(),
            status = error.http_status().map(|status| status.as_u16()),
            retryable = error.is_retryable(),
            "attempt failed"
        );
        if error.kind().is_terminal() {
            return fail(error);
        }

        let mut bonus = false;
        if let Some(correction) = inner.skew_corrector.observe(
            &inner.clock_skew_state,
            &error,
            signing_time,
            received_at,
        ) {
            warn!(
                previous_offset_ms = correction.previous.as_millis(),
                offset_ms = correction.offset.as_millis(),
                signing_delta_ms = correction.signing_delta.as_millis(),
                "clock skew detected; adjusted client clock offset"
            );
            inner.metrics.record_clock_skew_correction();
            inner
                .observer
                .on_clock_skew_corrected(request.operation_name(), &correction);
            bonus = context.claim_skew_retry();
        }

        let delay = if bonus {
            Duration::ZERO
        } else {
            match inner.retry_strategy.should_retry(&error, context.attempt()) {
                RetryVerdict::Retry => {
                    context.record_strategy_retry(error.kind());
                    inner
                        .retry_strategy
                        .compute_delay(&error, context.attempt())
                }
                RetryVerdict::Stop => return fail(error),
                RetryVerdict::Denied(reason) => {
                    warn!(
                        reason = reason.as_str(),
                        error_kind = error.kind().as_str(),
                        "retry denied"
                    );
                    inner.metrics.record_quota_denial();
                    return fail(error.with_retry_denial(reason));
                }
            }
        };

        if !context.has_next_attempt() {
            return fail(error);
        }
        let total_timeout = inner.defaults.total_timeout();
        let Some(delay) = bounded_retry_delay(delay, total_timeout, started) else {
            return fail(total_timeout_error(total_timeout));
        };

        debug!(
            delay_ms = delay.as_millis() as u64,
            clock_skew_retry = bonus,
            "retry scheduled"
        );
        inner
            .observer
            .on_retry_scheduled(request.operation_name(), context, &error, delay);
        let reference = error
            .server_date()
            .unwrap_or_else(|| inner.clock_skew_state.offset().apply(inner.clock.now()));
        context.advance(reference, attempt_timeout);
        context.record_error(error);
        AttemptStep::Retry { delay }
    }
}

fn fail(error: SdkError) -> AttemptStep {
    enter_state(ExecutionState::Failed);
    AttemptStep::Finished(Err(error))
}

fn total_timeout_error(total_timeout: Option<Duration>) -> SdkError {
    let total_ms = total_timeout.map_or(0, |timeout| timeout.as_millis());
    SdkError::new(
        ErrorKind::RequestTimeout,
        format!("total timeout of {total_ms}ms exhausted"),
    )
    .with_retryable(false)
}
