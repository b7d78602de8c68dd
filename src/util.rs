use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use http::header::{DATE, HeaderName, HeaderValue, RETRY_AFTER};
use http::HeaderMap;

use crate::error::SdkError;

const MAX_ERROR_BODY_LEN: usize = 512;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn merge_headers(default_headers: &HeaderMap, request_headers: &HeaderMap) -> HeaderMap {
    let mut merged = default_headers.clone();
    let mut replaced: Vec<&HeaderName> = Vec::new();
    for (name, value) in request_headers {
        if !replaced.contains(&name) {
            merged.remove(name);
            replaced.push(name);
        }
        merged.append(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);
    parsed.to_string()
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

pub(crate) fn append_query_pairs(path: &str, query_pairs: &[(String, String)]) -> String {
    if query_pairs.is_empty() {
        return path.to_owned();
    }

    let (base, existing_query) = match path.split_once('?') {
        Some((left, right)) => (left, Some(right)),
        None => (path, None),
    };
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if let Some(existing_query) = existing_query {
        for (name, value) in url::form_urlencoded::parse(existing_query.as_bytes()) {
            serializer.append_pair(&name, &value);
        }
    }
    for (name, value) in query_pairs {
        serializer.append_pair(name, value);
    }
    format!("{base}?{}", serializer.finish())
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, SdkError> {
    name.parse().map_err(|source| {
        SdkError::configuration(format!("invalid header name {name}")).with_source(source)
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, SdkError> {
    value.parse().map_err(|source| {
        SdkError::configuration(format!("invalid header value for {name}")).with_source(source)
    })
}

pub(crate) fn parse_date_header(headers: &HeaderMap) -> Option<SystemTime> {
    let raw_value = headers.get(DATE)?.to_str().ok()?.trim();
    httpdate::parse_http_date(raw_value).ok()
}

pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let raw_value = value.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

/// Time left for the next send, `None` once the total budget is spent.
pub(crate) fn phase_timeout(
    per_attempt_timeout: Duration,
    total_timeout: Option<Duration>,
    request_started_at: Instant,
) -> Option<Duration> {
    let Some(total_timeout) = total_timeout else {
        return Some(per_attempt_timeout);
    };

    let elapsed = request_started_at.elapsed();
    if elapsed >= total_timeout {
        return None;
    }

    let remaining = total_timeout - elapsed;
    Some(per_attempt_timeout.min(remaining))
}

pub(crate) fn bounded_retry_delay(
    retry_delay: Duration,
    total_timeout: Option<Duration>,
    request_started_at: Instant,
) -> Option<Duration> {
    let Some(total_timeout) = total_timeout else {
        return Some(retry_delay);
    };

    let elapsed = request_started_at.elapsed();
    if elapsed >= total_timeout {
        return None;
    }

    let remaining = total_timeout - elapsed;
    if retry_delay >= remaining {
        return None;
    }
    Some(retry_delay)
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
