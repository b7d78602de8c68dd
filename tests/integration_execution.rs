use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use reqcore::{
    AttemptContext, BearerTokenSigner, CancellationToken, ClockOffset, Credentials, ErrorKind,
    INVOCATION_ID_HEADER, ManualClock, Observer, REQUEST_INFO_HEADER, RequestSummary, RetryMode,
    RetryQuota, SdkError, ServiceClient, ServiceClientBuilder, ServiceRequest, SigV4Signer,
    SkewCorrection, Transport, TransportError, TransportErrorKind, WireRequest, WireResponse,
    format_ttl, parse_ttl, request_info_field,
};

const BASE_TIME_SECS: u64 = 1_700_000_000;

fn base_time() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(BASE_TIME_SECS)
}

enum Step {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: &'static str,
    },
    Fail(TransportErrorKind),
    Hang,
}

impl Step {
    fn status(status: u16) -> Self {
        Self::Respond {
            status,
            headers: Vec::new(),
            body: "",
        }
    }

    fn with_headers(status: u16, headers: Vec<(&'static str, String)>) -> Self {
        Self::Respond {
            status,
            headers,
            body: "",
        }
    }

    fn json(body: &'static str) -> Self {
        Self::Respond {
            status: 200,
            headers: vec![("content-type", "application/json".to_owned())],
            body,
        }
    }

    fn dated(status: u16, date: SystemTime) -> Self {
        Self::with_headers(status, vec![("date", httpdate::fmt_http_date(date))])
    }
}

#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    captured: Mutex<Vec<WireRequest>>,
}

impl ScriptedTransport {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            captured: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, steps: Vec<Step>) {
        self.script.lock().expect("lock script").extend(steps);
    }

    fn captured(&self) -> Vec<WireRequest> {
        self.captured.lock().expect("lock captured requests").clone()
    }

    fn sent(&self) -> usize {
        self.captured.lock().expect("lock captured requests").len()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: WireRequest,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<WireResponse, TransportError>> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .push(request);
        let step = self.script.lock().expect("lock script").pop_front();
        let result = match step {
            Some(Step::Respond {
                status,
                headers,
                body,
            }) => {
                let mut header_map = HeaderMap::new();
                for (name, value) in headers {
                    header_map.insert(
                        HeaderName::from_static(name),
                        HeaderValue::from_str(&value).expect("valid scripted header"),
                    );
                }
                Ok(WireResponse::new(
                    StatusCode::from_u16(status).expect("valid scripted status"),
                    header_map,
                    Bytes::from_static(body.as_bytes()),
                ))
            }
            Some(Step::Fail(kind)) => Err(TransportError::new(kind, "scripted failure")),
            Some(Step::Hang) => return Box::pin(std::future::pending()),
            None => Err(TransportError::new(
                TransportErrorKind::Other,
                "script exhausted",
            )),
        };
        Box::pin(async move { result })
    }
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
    delays: Mutex<Vec<Duration>>,
    corrections: Mutex<Vec<SkewCorrection>>,
    summaries: Mutex<Vec<RequestSummary>>,
}

impl Observer for RecordingObserver {
    fn on_attempt_start(&self, operation: &str, context: &AttemptContext) {
        self.events
            .lock()
            .expect("lock events")
            .push(format!("start:{operation}:{}", context.attempt()));
    }

    fn on_retry_scheduled(
        &self,
        operation: &str,
        context: &AttemptContext,
        error: &SdkError,
        delay: Duration,
    ) {
        self.events.lock().expect("lock events").push(format!(
            "retry:{operation}:{}:{}",
            context.attempt(),
            error.kind().as_str()
        ));
        self.delays.lock().expect("lock delays").push(delay);
    }

    fn on_clock_skew_corrected(&self, operation: &str, correction: &SkewCorrection) {
        self.events
            .lock()
            .expect("lock events")
            .push(format!("skew:{operation}"));
        self.corrections
            .lock()
            .expect("lock corrections")
            .push(*correction);
    }

    fn on_request_finished(&self, operation: &str, summary: &RequestSummary) {
        self.events
            .lock()
            .expect("lock events")
            .push(format!("finished:{operation}:{}", summary.attempts));
        self.summaries.lock().expect("lock summaries").push(*summary);
    }
}

fn builder(transport: Arc<ScriptedTransport>, clock: Arc<ManualClock>) -> ServiceClientBuilder {
    ServiceClient::builder()
        .client_name("integration")
        .endpoint("https://service.example.com")
        .transport(transport)
        .clock(clock)
}

fn header<'a>(request: &'a WireRequest, name: &str) -> &'a str {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn transient_failures_then_success() {
    let transport = ScriptedTransport::new(vec![
        Step::status(503),
        Step::Fail(TransportErrorKind::Connect),
        Step::json(r#"{"id":"42"}"#),
    ]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Legacy)
        .metrics_enabled(true)
        .try_build()
        .expect("client should build");

    let value: serde_json::Value = client
        .execute_json(&ServiceRequest::get("/items/42").operation("GetItem"))
        .await
        .expect("third attempt should succeed");

    assert_eq!(value["id"], "42");
    assert_eq!(transport.sent(), 3);
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.attempts, 3);
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.requests_succeeded, 1);
    assert_eq!(metrics.status_counts.get(&503), Some(&1));
    assert_eq!(metrics.status_counts.get(&200), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn non_retryable_status_stops_after_one_attempt() {
    let transport = ScriptedTransport::new(vec![Step::status(404), Step::status(200)]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Legacy)
        .try_build()
        .expect("client should build");

    let error = client
        .execute(&ServiceRequest::get("/missing"))
        .await
        .expect_err("404 should fail");

    assert_eq!(error.kind(), ErrorKind::ClientFault);
    assert_eq!(error.http_status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(error.attempts(), 1);
    assert!(!error.is_retryable());
    assert_eq!(transport.sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn throttling_error_code_on_a_400_is_retried() {
    let transport = ScriptedTransport::new(vec![
        Step::with_headers(400, vec![("x-error-code", "ThrottlingException".to_owned())]),
        Step::status(200),
    ]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Standard)
        .try_build()
        .expect("client should build");

    client
        .execute(&ServiceRequest::post("/queue").body("payload"))
        .await
        .expect("retry after throttling should succeed");

    assert_eq!(transport.sent(), 2);
    // 500 - 5 for the throttling retry, + 5 back on success.
    assert_eq!(client.retry_quota().map(|quota| quota.available()), Some(500));
}

#[tokio::test(start_paused = true)]
async fn skewed_server_date_grants_one_extra_attempt_and_persists() {
    let server_time = base_time() + Duration::from_secs(3600);
    let transport = ScriptedTransport::new(vec![
        Step::dated(400, server_time),
        Step::dated(400, server_time),
    ]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let observer = Arc::new(RecordingObserver::default());
    let signer = SigV4Signer::new(
        Credentials::new("AKIDEXAMPLE", "secret"),
        "us-east-1",
        "items",
    );
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Standard)
        .signer(Arc::new(signer))
        .observer(observer.clone())
        .metrics_enabled(true)
        .try_build()
        .expect("client should build");

    let error = client
        .execute(&ServiceRequest::get("/items").operation("ListItems"))
        .await
        .expect_err("400 should still fail after the skew retry");

    assert_eq!(error.kind(), ErrorKind::ClientFault);
    assert_eq!(error.attempts(), 2);
    assert_eq!(
        client.clock_skew_state().offset(),
        ClockOffset::from_millis(3_600_000)
    );
    assert_eq!(client.metrics_snapshot().clock_skew_corrections, 1);
    assert_eq!(client.metrics_snapshot().retries, 1);
    // The extra attempt does not draw from the quota.
    assert_eq!(client.retry_quota().map(|quota| quota.available()), Some(500));

    let captured = transport.captured();
    assert_eq!(header(&captured[0], "x-amz-date"), format_ttl(base_time()));
    assert_eq!(header(&captured[1], "x-amz-date"), format_ttl(server_time));

    let corrections = observer.corrections.lock().expect("lock corrections").clone();
    assert_eq!(corrections.len(), 1);
    assert!(corrections[0].previous.is_zero());

    // The learned offset applies to the next request, which gets no bonus.
    transport.push(vec![Step::dated(400, server_time)]);
    let error = client
        .execute(&ServiceRequest::get("/items").operation("ListItems"))
        .await
        .expect_err("400 should fail");
    assert_eq!(error.attempts(), 1);
    assert_eq!(transport.sent(), 3);
    assert_eq!(
        header(&transport.captured()[2], "x-amz-date"),
        format_ttl(server_time)
    );
}

#[tokio::test(start_paused = true)]
async fn small_skew_is_left_alone() {
    let transport = ScriptedTransport::new(vec![Step::dated(
        400,
        base_time() + Duration::from_secs(120),
    )]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Standard)
        .try_build()
        .expect("client should build");

    let error = client
        .execute(&ServiceRequest::get("/items"))
        .await
        .expect_err("400 should fail");

    assert_eq!(error.attempts(), 1);
    assert!(client.clock_skew_state().offset().is_zero());
    assert!(!client.clock_skew_state().has_been_set());
}

#[tokio::test(start_paused = true)]
async fn skew_adjustment_can_be_disabled() {
    let transport = ScriptedTransport::new(vec![
        Step::dated(403, base_time() + Duration::from_secs(3600)),
        Step::status(200),
    ]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Standard)
        .clock_skew_adjustment(false)
        .try_build()
        .expect("client should build");

    let error = client
        .execute(&ServiceRequest::get("/items"))
        .await
        .expect_err("403 should fail");

    assert_eq!(error.kind(), ErrorKind::SignatureOrClockSkew);
    assert_eq!(transport.sent(), 1);
    assert!(client.clock_skew_state().offset().is_zero());
}

#[tokio::test(start_paused = true)]
async fn retry_deadline_follows_the_server_date() {
    let server_time = base_time() + Duration::from_secs(10);
    let transport =
        ScriptedTransport::new(vec![Step::dated(503, server_time), Step::status(200)]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Standard)
        .request_timeout(Duration::from_secs(30))
        .try_build()
        .expect("client should build");

    client
        .execute(&ServiceRequest::get("/items"))
        .await
        .expect("second attempt should succeed");

    let captured = transport.captured();
    assert_eq!(header(&captured[0], REQUEST_INFO_HEADER), "attempt=1; max=3");

    let info = header(&captured[1], REQUEST_INFO_HEADER);
    assert_eq!(request_info_field(info, "attempt"), Some("2"));
    assert_eq!(request_info_field(info, "max"), Some("3"));
    let ttl = request_info_field(info, "ttl")
        .and_then(parse_ttl)
        .expect("retry should carry a ttl");
    let expected = server_time + Duration::from_secs(30);
    let low = expected - Duration::from_secs(2);
    let high = expected + Duration::from_secs(2);
    assert!(ttl >= low && ttl <= high, "ttl {} out of range", format_ttl(ttl));
}

#[tokio::test(start_paused = true)]
async fn legacy_mode_reports_eleven_attempts_with_one_invocation_id() {
    let transport = ScriptedTransport::new((0..11).map(|_| Step::status(500)).collect());
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Legacy)
        .try_build()
        .expect("client should build");

    let error = client
        .execute(&ServiceRequest::get("/items"))
        .await
        .expect_err("every attempt fails");

    assert_eq!(error.kind(), ErrorKind::ServerFault);
    assert_eq!(error.attempts(), 11);

    let captured = transport.captured();
    assert_eq!(captured.len(), 11);
    let invocation_id = header(&captured[0], INVOCATION_ID_HEADER).to_owned();
    assert!(!invocation_id.is_empty());
    for (index, request) in captured.iter().enumerate() {
        assert_eq!(header(request, INVOCATION_ID_HEADER), invocation_id);
        let info = header(request, REQUEST_INFO_HEADER);
        let attempt = (index + 1).to_string();
        assert_eq!(request_info_field(info, "attempt"), Some(attempt.as_str()));
        assert_eq!(request_info_field(info, "max"), Some("11"));
    }
}

#[tokio::test(start_paused = true)]
async fn invocation_ids_differ_between_requests() {
    let transport = ScriptedTransport::new(vec![Step::status(200), Step::status(200)]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .try_build()
        .expect("client should build");

    client.execute(&ServiceRequest::get("/a")).await.unwrap();
    client.execute(&ServiceRequest::get("/b")).await.unwrap();

    let captured = transport.captured();
    assert_ne!(
        header(&captured[0], INVOCATION_ID_HEADER),
        header(&captured[1], INVOCATION_ID_HEADER)
    );
}

#[tokio::test(start_paused = true)]
async fn standard_quota_drains_and_refills_across_requests() {
    let quota = Arc::new(RetryQuota::new(500));
    let transport = ScriptedTransport::new(Vec::new());
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Standard)
        .max_attempts(3)
        .retry_quota(quota.clone())
        .metrics_enabled(true)
        .try_build()
        .expect("client should build");
    let request = ServiceRequest::get("/items");

    // Success without retry refunds one token, capped at capacity.
    transport.push(vec![Step::status(200)]);
    client.execute(&request).await.unwrap();
    assert_eq!(quota.available(), 500);

    // Connection (5) and timeout (10) retries, then attempts run out.
    transport.push(vec![
        Step::Fail(TransportErrorKind::Connect),
        Step::Fail(TransportErrorKind::Timeout),
        Step::Fail(TransportErrorKind::Connect),
    ]);
    let error = client.execute(&request).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NetworkConnection);
    assert_eq!(error.attempts(), 3);
    assert_eq!(error.retry_denial(), None);
    assert_eq!(quota.available(), 485);

    // Same retries, then success refunds the cost of the last failure.
    transport.push(vec![
        Step::Fail(TransportErrorKind::Connect),
        Step::Fail(TransportErrorKind::Timeout),
        Step::status(200),
    ]);
    client.execute(&request).await.unwrap();
    assert_eq!(quota.available(), 480);

    // Drain to 7: one retry fits, the next is denied.
    assert!(quota.try_acquire(473));
    transport.push(vec![
        Step::Fail(TransportErrorKind::Connect),
        Step::Fail(TransportErrorKind::Connect),
    ]);
    let error = client.execute(&request).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NetworkConnection);
    assert_eq!(error.retry_denial(), Some(ErrorKind::QuotaExhausted));
    assert_eq!(error.attempts(), 2);
    assert_eq!(quota.available(), 2);

    transport.push(vec![Step::Fail(TransportErrorKind::Connect)]);
    let error = client.execute(&request).await.unwrap_err();
    assert_eq!(error.retry_denial(), Some(ErrorKind::QuotaExhausted));
    assert_eq!(error.attempts(), 1);
    assert_eq!(quota.available(), 2);

    transport.push(vec![Step::status(200)]);
    client.execute(&request).await.unwrap();
    assert_eq!(quota.available(), 3);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.quota_denials, 2);
    assert_eq!(metrics.requests_succeeded, 3);
    assert_eq!(metrics.requests_failed, 3);
}

#[tokio::test(start_paused = true)]
async fn clients_sharing_a_quota_draw_from_the_same_bucket() {
    let quota = Arc::new(RetryQuota::new(10));
    let clock = Arc::new(ManualClock::new(base_time()));
    let first_transport = ScriptedTransport::new(vec![
        Step::Fail(TransportErrorKind::Timeout),
        Step::status(500),
    ]);
    let second_transport = ScriptedTransport::new(vec![Step::status(500)]);
    let first = builder(first_transport.clone(), clock.clone())
        .retry_mode(RetryMode::Standard)
        .max_attempts(2)
        .retry_quota(quota.clone())
        .try_build()
        .unwrap();
    let second = builder(second_transport.clone(), clock)
        .retry_mode(RetryMode::Standard)
        .retry_quota(quota.clone())
        .try_build()
        .unwrap();

    first.execute(&ServiceRequest::get("/a")).await.unwrap_err();
    assert_eq!(quota.available(), 0);

    let error = second.execute(&ServiceRequest::get("/b")).await.unwrap_err();
    assert_eq!(error.retry_denial(), Some(ErrorKind::QuotaExhausted));
    assert_eq!(second_transport.sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_sets_the_delay() {
    let transport = ScriptedTransport::new(vec![
        Step::with_headers(503, vec![("retry-after", "3".to_owned())]),
        Step::status(200),
    ]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let observer = Arc::new(RecordingObserver::default());
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Legacy)
        .observer(observer.clone())
        .try_build()
        .expect("client should build");

    let started = tokio::time::Instant::now();
    client
        .execute(&ServiceRequest::get("/items"))
        .await
        .expect("second attempt should succeed");

    assert_eq!(
        observer.delays.lock().expect("lock delays").as_slice(),
        &[Duration::from_secs(3)]
    );
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn observer_sees_every_transition() {
    let transport = ScriptedTransport::new(vec![Step::status(503), Step::status(200)]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let observer = Arc::new(RecordingObserver::default());
    let client = builder(transport, clock)
        .retry_mode(RetryMode::Standard)
        .observer(observer.clone())
        .try_build()
        .expect("client should build");

    client
        .execute(&ServiceRequest::get("/items").operation("ListItems"))
        .await
        .expect("second attempt should succeed");

    let events = observer.events.lock().expect("lock events").clone();
    assert_eq!(
        events,
        vec![
            "start:ListItems:1".to_owned(),
            "retry:ListItems:1:throttling".to_owned(),
            "start:ListItems:2".to_owned(),
            "finished:ListItems:2".to_owned(),
        ]
    );
    let summaries = observer.summaries.lock().expect("lock summaries").clone();
    assert_eq!(summaries[0].status, Some(StatusCode::OK));
    assert_eq!(summaries[0].error_kind, None);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_stops_the_request() {
    let transport = ScriptedTransport::new(vec![
        Step::with_headers(503, vec![("retry-after", "10".to_owned())]),
        Step::status(200),
    ]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Legacy)
        .metrics_enabled(true)
        .try_build()
        .expect("client should build");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let error = client
        .execute_with_cancellation(&ServiceRequest::get("/items"), &cancel)
        .await
        .expect_err("cancelled during backoff");

    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert_eq!(error.attempts(), 1);
    assert_eq!(transport.sent(), 1);
    assert_eq!(client.metrics_snapshot().cancellations, 1);
    assert_eq!(client.metrics_snapshot().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_send_aborts_the_attempt() {
    let transport = ScriptedTransport::new(vec![Step::Hang]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .try_build()
        .expect("client should build");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let error = client
        .execute_with_cancellation(&ServiceRequest::get("/slow"), &cancel)
        .await
        .expect_err("cancelled during send");

    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert_eq!(error.attempts(), 1);
    assert_eq!(transport.sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn already_cancelled_token_sends_nothing() {
    let transport = ScriptedTransport::new(vec![Step::status(200)]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .try_build()
        .expect("client should build");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = client
        .execute_with_cancellation(&ServiceRequest::get("/items"), &cancel)
        .await
        .expect_err("token was already cancelled");

    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert_eq!(error.attempts(), 0);
    assert_eq!(transport.sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_signer_fails_before_sending() {
    let transport = ScriptedTransport::new(vec![Step::status(200)]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .try_build()
        .expect("client should build");

    let error = client
        .execute(&ServiceRequest::get("/items").signer("does-not-exist"))
        .await
        .expect_err("unknown signer");

    assert_eq!(error.kind(), ErrorKind::Configuration);
    assert_eq!(transport.sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn named_signer_is_selected_per_request() {
    let transport = ScriptedTransport::new(vec![Step::status(200), Step::status(200)]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .named_signer(Arc::new(
            BearerTokenSigner::try_new("token-1").expect("valid token"),
        ))
        .try_build()
        .expect("client should build");

    client
        .execute(&ServiceRequest::get("/public"))
        .await
        .unwrap();
    client
        .execute(&ServiceRequest::get("/private").signer("bearer"))
        .await
        .unwrap();

    let captured = transport.captured();
    assert!(captured[0].headers().get("authorization").is_none());
    assert_eq!(header(&captured[1], "authorization"), "Bearer token-1");
}

#[tokio::test(start_paused = true)]
async fn missing_host_prefix_field_is_a_configuration_error() {
    let transport = ScriptedTransport::new(vec![Step::status(200)]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .try_build()
        .expect("client should build");

    let error = client
        .execute(&ServiceRequest::get("/items").host_prefix("{AccountId}."))
        .await
        .expect_err("host prefix field is missing");

    assert_eq!(error.kind(), ErrorKind::Configuration);
    assert_eq!(error.attempts(), 1);
    assert_eq!(transport.sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn total_timeout_stops_retries() {
    let transport = ScriptedTransport::new(vec![
        Step::with_headers(503, vec![("retry-after", "15".to_owned())]),
        Step::status(200),
    ]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Legacy)
        .total_timeout(Duration::from_secs(5))
        .try_build()
        .expect("client should build");

    let error = client
        .execute(&ServiceRequest::get("/items"))
        .await
        .expect_err("the retry delay does not fit in the total timeout");

    assert_eq!(error.kind(), ErrorKind::RequestTimeout);
    assert!(!error.is_retryable());
    assert_eq!(transport.sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn tls_and_unknown_transport_failures_are_retried() {
    for kind in [TransportErrorKind::Tls, TransportErrorKind::Other] {
        let transport = ScriptedTransport::new(vec![Step::Fail(kind), Step::status(200)]);
        let clock = Arc::new(ManualClock::new(base_time()));
        let client = builder(transport.clone(), clock)
            .try_build()
            .expect("client should build");

        client
            .execute(&ServiceRequest::get("/items"))
            .await
            .unwrap_or_else(|error| panic!("{kind} failure should be retried: {error}"));

        assert_eq!(transport.sent(), 2, "{kind}");
        assert_eq!(
            client.retry_quota().map(|quota| quota.available()),
            Some(500),
            "{kind}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn skew_retry_after_a_timeout_credits_the_timeout_cost() {
    let transport = ScriptedTransport::new(vec![
        Step::Fail(TransportErrorKind::Timeout),
        Step::dated(400, base_time() + Duration::from_secs(3600)),
        Step::status(200),
    ]);
    let clock = Arc::new(ManualClock::new(base_time()));
    let quota = Arc::new(RetryQuota::new(500));
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Standard)
        .retry_quota(quota.clone())
        .try_build()
        .expect("client should build");

    client
        .execute(&ServiceRequest::get("/items"))
        .await
        .expect("third attempt should succeed");

    assert_eq!(transport.sent(), 3);
    assert_eq!(
        client.clock_skew_state().offset(),
        ClockOffset::from_millis(3_600_000)
    );
    // 10 debited for the timeout retry, 10 credited back on success.
    assert_eq!(quota.available(), 500);
}

#[tokio::test(start_paused = true)]
async fn server_clock_that_keeps_moving_is_corrected_on_each_request() {
    let one_hour = Duration::from_secs(3600);
    let transport = ScriptedTransport::new(Vec::new());
    let clock = Arc::new(ManualClock::new(base_time()));
    let observer = Arc::new(RecordingObserver::default());
    let signer = SigV4Signer::new(
        Credentials::new("AKIDEXAMPLE", "secret"),
        "us-east-1",
        "items",
    );
    let client = builder(transport.clone(), clock)
        .retry_mode(RetryMode::Standard)
        .signer(Arc::new(signer))
        .observer(observer.clone())
        .try_build()
        .expect("client should build");
    let request = ServiceRequest::get("/items").operation("ListItems");

    let server_times = [
        base_time() + one_hour,
        base_time() + one_hour * 2,
        base_time(),
    ];
    let expected_offsets = [3_600_000, 7_200_000, 0];
    for (server_time, expected_offset) in server_times.into_iter().zip(expected_offsets) {
        let sent_before = transport.sent();
        transport.push(vec![Step::dated(400, server_time), Step::status(200)]);

        client
            .execute(&request)
            .await
            .expect("the clock-skew retry should succeed");

        assert_eq!(transport.sent() - sent_before, 2);
        assert_eq!(
            client.clock_skew_state().offset(),
            ClockOffset::from_millis(expected_offset)
        );
        let retried = &transport.captured()[sent_before + 1];
        assert_eq!(header(retried, "x-amz-date"), format_ttl(server_time));
    }

    let corrections = observer.corrections.lock().expect("lock corrections").clone();
    let previous: Vec<i64> = corrections
        .iter()
        .map(|correction| correction.previous.as_millis())
        .collect();
    assert_eq!(previous, vec![0, 3_600_000, 7_200_000]);
    let summaries = observer.summaries.lock().expect("lock summaries").clone();
    assert!(summaries.iter().all(|summary| summary.attempts == 2));
}

/// Fails the first attempt of every logical request and answers the rest.
#[derive(Default)]
struct FirstAttemptFails {
    sent: std::sync::atomic::AtomicUsize,
}

impl Transport for FirstAttemptFails {
    fn send(
        &self,
        request: WireRequest,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<WireResponse, TransportError>> {
        self.sent.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let info = header(&request, REQUEST_INFO_HEADER);
        let first = request_info_field(info, "attempt") == Some("1");
        Box::pin(async move {
            if first {
                return Err(TransportError::new(
                    TransportErrorKind::Connect,
                    "connection reset",
                ));
            }
            Ok(WireResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::new()))
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_quota_without_leaking_tokens() {
    const REQUESTS: usize = 64;
    let quota = Arc::new(RetryQuota::new(100));
    let transport = Arc::new(FirstAttemptFails::default());
    let client = ServiceClient::builder()
        .client_name("concurrent")
        .endpoint("https://service.example.com")
        .transport(transport.clone())
        .retry_mode(RetryMode::Standard)
        .retry_quota(quota.clone())
        .try_build()
        .expect("client should build");

    let handles: Vec<_> = (0..REQUESTS)
        .map(|index| {
            let client = client.clone();
            let quota = quota.clone();
            tokio::spawn(async move {
                let result = client
                    .execute(&ServiceRequest::get(format!("/items/{index}")))
                    .await;
                assert!(quota.available() <= quota.capacity());
                result
            })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.expect("request task should not panic") {
            Ok(_) => succeeded += 1,
            Err(error) => {
                assert_eq!(error.kind(), ErrorKind::NetworkConnection);
                assert_eq!(error.retry_denial(), Some(ErrorKind::QuotaExhausted));
                assert_eq!(error.attempts(), 1);
            }
        }
    }

    // Each retry debits 5 and its success credits 5; denials debit nothing.
    assert!(succeeded >= 20);
    assert_eq!(quota.available(), 100);
    assert_eq!(
        transport.sent.load(std::sync::atomic::Ordering::SeqCst),
        REQUESTS + succeeded
    );
}
