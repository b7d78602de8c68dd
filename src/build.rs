use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue, USER_AGENT};
use http::Uri;

use crate::Outcome;
use crate::attempt::{AttemptContext, INVOCATION_ID_HEADER, REQUEST_INFO_HEADER};
use crate::config::ClientDefaults;
use crate::error::SdkError;
use crate::request::ServiceRequest;
use crate::transport::WireRequest;
use crate::util::{append_query_pairs, join_base_path, merge_headers};

/// Produces the wire request for the attempt described by `context`.
pub fn build_wire_request(
    request: &ServiceRequest,
    defaults: &ClientDefaults,
    endpoint: &str,
    context: &AttemptContext,
) -> Outcome<WireRequest> {
    let endpoint = match request.host_prefix_template() {
        Some(template) if defaults.host_prefix_injection_enabled() => {
            let prefix = expand_host_prefix(template, request)?;
            prepend_host_prefix(endpoint, &prefix)?
        }
        _ => endpoint.to_owned(),
    };

    let url = append_query_pairs(&join_base_path(&endpoint, request.path()), request.query());
    let uri: Uri = url.parse().map_err(|source| {
        SdkError::configuration(format!("invalid request uri {url}")).with_source(source)
    })?;

    let mut headers = merge_headers(defaults.default_headers(), request.headers());
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, defaults.user_agent().clone());
    }

    match request.body_bytes() {
        Some(body) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            if let Some(algorithm) = request.content_digest() {
                headers.insert(algorithm.header_name(), algorithm.header_value(body));
            }
        }
        None => {
            headers.remove(CONTENT_LENGTH);
            headers.remove(CONTENT_TYPE);
        }
    }

    headers.insert(
        HeaderName::from_static(INVOCATION_ID_HEADER),
        header_value(&context.invocation_id().to_string())?,
    );
    headers.insert(
        HeaderName::from_static(REQUEST_INFO_HEADER),
        header_value(&context.request_info())?,
    );

    Ok(WireRequest::new(
        request.method().clone(),
        uri,
        headers,
        request.body_bytes().cloned(),
    ))
}

fn header_value(value: &str) -> Outcome<HeaderValue> {
    HeaderValue::from_str(value).map_err(|source| {
        SdkError::configuration(format!("invalid generated header value {value}"))
            .with_source(source)
    })
}

/// Replaces every `{Name}` in `template` with the request's field `Name`.
pub(crate) fn expand_host_prefix(template: &str, request: &ServiceRequest) -> Outcome<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        expanded.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('}') else {
            return Err(SdkError::configuration(format!(
                "unterminated placeholder in host prefix {template:?}"
            )));
        };
        let name = &after_open[..close];
        let value = request.host_prefix_value(name).unwrap_or_default();
        if value.is_empty() {
            return Err(SdkError::configuration(format!(
                "host prefix field {name} is missing or empty"
            )));
        }
        if !is_valid_host_label_text(value) {
            return Err(SdkError::configuration(format!(
                "host prefix field {name} is not a valid host label: {value:?}"
            )));
        }
        expanded.push_str(value);
        rest = &after_open[close + 1..];
    }
    expanded.push_str(rest);

    if !is_valid_host_label_text(&expanded) {
        return Err(SdkError::configuration(format!(
            "expanded host prefix {expanded:?} is not a valid host label"
        )));
    }
    Ok(expanded)
}

fn is_valid_host_label_text(value: &str) -> bool {
    value
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.')
}

fn prepend_host_prefix(endpoint: &str, prefix: &str) -> Outcome<String> {
    if prefix.is_empty() {
        return Ok(endpoint.to_owned());
    }
    let mut url = url::Url::parse(endpoint).map_err(|source| {
        SdkError::configuration(format!("invalid endpoint {endpoint}")).with_source(source)
    })?;
    let Some(host) = url.host_str() else {
        return Err(SdkError::configuration(format!(
            "endpoint {endpoint} has no host to prefix"
        )));
    };
    let prefixed = format!("{prefix}{host}");
    url.set_host(Some(&prefixed)).map_err(|source| {
        SdkError::configuration(format!("invalid prefixed host {prefixed}")).with_source(source)
    })?;
    Ok(url.to_string())
}
