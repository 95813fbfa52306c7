//! The versioned wire schemas of the symbolication API.
//!
//! Both versions map onto the same internal [`Job`] model. Validation
//! failures are rejected with an enumerated reason that doubles as the
//! `request_error` metric tag.

pub mod v4;
pub mod v5;

use axum::extract::rejection::BytesRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use symserver_common::ModuleKey;

use crate::metric;
use crate::symbolication::{FrameRequest, Job, SymbolicationError};

/// A request rejection with an enumerated reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationError {
    reason: &'static str,
}

impl ValidationError {
    pub(crate) fn new(reason: &'static str) -> Self {
        ValidationError { reason }
    }

    /// The stable reason string, used in the response body and metric tag.
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        metric!(counter("symbolicate.request_error") += 1, "reason" => self.reason);
        (StatusCode::BAD_REQUEST, Json(json!({ "error": self.reason }))).into_response()
    }
}

/// Unwraps a buffered request body.
///
/// The router caps body sizes via [`DefaultBodyLimit`], so a rejection here
/// means the payload exceeded the configured limit.
///
/// [`DefaultBodyLimit`]: axum::extract::DefaultBodyLimit
pub(crate) fn require_body(body: Result<Bytes, BytesRejection>) -> Result<Bytes, ValidationError> {
    body.map_err(|_| ValidationError::new("too_large"))
}

/// Renders a request-fatal internal failure as HTTP 500.
///
/// The correlation id ties the client-visible response to the server log
/// line carrying the underlying error.
pub(crate) fn internal_error_response(error: &SymbolicationError) -> Response {
    let correlation_id = uuid::Uuid::new_v4();
    tracing::error!(%correlation_id, %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "internal_error",
            "correlation_id": correlation_id.to_string(),
        })),
    )
        .into_response()
}

/// One job as found on the wire, shared by both API versions.
#[derive(Debug, Deserialize)]
pub(crate) struct RawJob {
    #[serde(rename = "memoryMap")]
    memory_map: Vec<(String, String)>,
    stacks: Vec<Vec<(i64, i64)>>,
}

/// Validates a wire job into the internal model.
///
/// `module_index` must be an integer ≥ −1 and in range of the memory map;
/// `address_offset` must be non-negative. `-1` marks a frame that belongs
/// to no module.
pub(crate) fn convert_job(raw: RawJob) -> Result<Job, ValidationError> {
    let mut memory_map = Vec::with_capacity(raw.memory_map.len());
    for (debug_file, debug_id) in &raw.memory_map {
        let key = ModuleKey::new(debug_file, debug_id)
            .map_err(|_| ValidationError::new("invalid_memory_map"))?;
        memory_map.push(key);
    }

    let mut stacks = Vec::with_capacity(raw.stacks.len());
    for raw_stack in &raw.stacks {
        let mut stack = Vec::with_capacity(raw_stack.len());
        for &(module_index, offset) in raw_stack {
            let module_index = match module_index {
                -1 => None,
                index if index >= 0 => {
                    let index = index as usize;
                    if index >= memory_map.len() {
                        return Err(ValidationError::new("invalid_module_index"));
                    }
                    Some(index)
                }
                _ => return Err(ValidationError::new("invalid_stacks")),
            };
            if offset < 0 {
                return Err(ValidationError::new("invalid_stacks"));
            }
            stack.push(FrameRequest {
                module_index,
                offset: offset as u64,
            });
        }
        stacks.push(stack);
    }

    Ok(Job { memory_map, stacks })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: serde_json::Value) -> RawJob {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn converts_a_valid_job() {
        let job = convert_job(raw(serde_json::json!({
            "memoryMap": [["xul.pdb", "44E4EC8C2F41492B9369D6B9A059577C2"]],
            "stacks": [[[0, 0x1234], [-1, 16]]],
        })))
        .unwrap();

        assert_eq!(job.memory_map.len(), 1);
        assert_eq!(job.memory_map[0].debug_file(), "xul.pdb");
        assert_eq!(
            job.stacks,
            vec![vec![
                FrameRequest {
                    module_index: Some(0),
                    offset: 0x1234
                },
                FrameRequest {
                    module_index: None,
                    offset: 16
                },
            ]]
        );
    }

    #[test]
    fn rejects_bad_module_names() {
        let error = convert_job(raw(serde_json::json!({
            "memoryMap": [["../evil", "DEADBEEF"]],
            "stacks": [],
        })))
        .unwrap_err();
        assert_eq!(error.reason(), "invalid_memory_map");

        let error = convert_job(raw(serde_json::json!({
            "memoryMap": [["xul.pdb", "not hex"]],
            "stacks": [],
        })))
        .unwrap_err();
        assert_eq!(error.reason(), "invalid_memory_map");
    }

    #[test]
    fn rejects_out_of_range_module_indices() {
        let error = convert_job(raw(serde_json::json!({
            "memoryMap": [["xul.pdb", "DEADBEEF"]],
            "stacks": [[[1, 0]]],
        })))
        .unwrap_err();
        assert_eq!(error.reason(), "invalid_module_index");
    }

    #[test]
    fn rejects_negative_values() {
        let error = convert_job(raw(serde_json::json!({
            "memoryMap": [["xul.pdb", "DEADBEEF"]],
            "stacks": [[[-2, 0]]],
        })))
        .unwrap_err();
        assert_eq!(error.reason(), "invalid_stacks");

        let error = convert_job(raw(serde_json::json!({
            "memoryMap": [["xul.pdb", "DEADBEEF"]],
            "stacks": [[[0, -5]]],
        })))
        .unwrap_err();
        assert_eq!(error.reason(), "invalid_stacks");
    }
}
