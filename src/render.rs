//! Response aggregation and envelope rendering.
//!
//! Business failures render as HTTP 200 with an embedded negative code;
//! the `debug` and `callback` query modifiers apply uniformly to every
//! envelope, including not-found and recovery output.

use crate::context::RequestParts;
use crate::error::GatewayError;
use crate::node::{ExecInfo, NodeResult};
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Response, StatusCode};
use serde_json::{json, Value};

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
// callback wrapping is delivered as script text, not JSON
const JSONP_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Merge collected branch results into the reply payload.
///
/// A single result is returned unwrapped, and several results merge into
/// an object keyed by each node's attribute name. Zero results fall back
/// to a service-unavailable envelope.
pub fn merge_results(results: &[NodeResult]) -> Value {
    match results.len() {
        0 => error_value(&GatewayError::BackendServiceError),
        1 => result_value(&results[0]),
        _ => Value::Object(
            results
                .iter()
                .map(|result| (result.attr.clone(), result_value(result)))
                .collect(),
        ),
    }
}

fn result_value(result: &NodeResult) -> Value {
    match &result.outcome {
        Err(err) => error_value(err),
        Ok(body) => serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned())),
    }
}

/// An error as its `{code, msg}` envelope object.
pub fn error_value(err: &GatewayError) -> Value {
    serde_json::to_value(err).unwrap_or_else(|_| json!({"code": err.code(), "msg": err.to_string()}))
}

/// Build the final reply for a payload, applying the request-driven
/// modifiers: `debug=true` attaches the execution traces, `callback=name`
/// wraps the payload as a callback invocation and switches the content
/// type to plain text.
pub fn render_envelope(parts: &RequestParts, payload: Value, traces: &[ExecInfo]) -> Response<Body> {
    let payload = if parts.query("debug") == Some("true") {
        json!({
            "exec": traces,
            "response": payload,
        })
    } else {
        payload
    };

    let callback = parts.query("callback").filter(|name| !name.is_empty());
    let (content_type, body) = match callback {
        Some(name) => (JSONP_CONTENT_TYPE, format!("{name}({payload})")),
        None => (JSON_CONTENT_TYPE, payload.to_string()),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
