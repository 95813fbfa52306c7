//! The legacy v4 symbolication API.
//!
//! One job per request; frames come back as preformatted strings and
//! inlines are flattened to the innermost frame.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::api::{convert_job, internal_error_response, require_body, RawJob, ValidationError};
use crate::metric;
use crate::server::AppState;
use crate::symbolication::{JobResult, SymbolicatedFrame};

#[derive(Debug, Deserialize)]
struct V4Request {
    #[serde(flatten)]
    job: RawJob,
    /// Historical request field; carried by old clients and ignored.
    #[serde(default, rename = "version")]
    _version: Option<u32>,
}

#[derive(Debug, Serialize)]
struct V4Response {
    #[serde(rename = "symbolicatedStacks")]
    symbolicated_stacks: Vec<Vec<String>>,
    #[serde(rename = "knownModules")]
    known_modules: Vec<bool>,
}

pub(crate) async fn handle(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let started = Instant::now();

    let body = match require_body(body) {
        Ok(body) => body,
        Err(error) => return error.into_response(),
    };
    let request: V4Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return ValidationError::new("invalid_json").into_response(),
    };
    let job = match convert_job(request.job) {
        Ok(job) => job,
        Err(error) => return error.into_response(),
    };

    let result = match state.symbolicator.symbolicate(vec![job]).await {
        Ok(mut results) => results.pop().unwrap_or_default(),
        Err(error) => return internal_error_response(&error),
    };

    let response = render(&result);
    metric!(timer("symbolicate.api") = started.elapsed(), "version" => "v4");
    Json(response).into_response()
}

fn render(result: &JobResult) -> V4Response {
    let symbolicated_stacks = result
        .stacks
        .iter()
        .map(|stack| stack.iter().map(|frame| render_frame(frame, result)).collect())
        .collect();

    let known_modules = result
        .modules
        .iter()
        .map(|(_, state)| state.found())
        .collect();

    V4Response {
        symbolicated_stacks,
        known_modules,
    }
}

/// Renders one frame in the historical string format:
/// `name (in module)`, `0xOFFSET (in module)` or `0xADDR`.
fn render_frame(frame: &SymbolicatedFrame, result: &JobResult) -> String {
    let module = frame
        .module_index
        .and_then(|index| result.modules.get(index))
        .map(|(key, _)| key.debug_file());

    // v4 flattens inline expansions to the innermost frame.
    let innermost = frame
        .inlines
        .first()
        .map(|inline| inline.function.as_str())
        .or(frame.function.as_deref());

    match (innermost, module) {
        (Some(function), Some(module)) => format!("{function} (in {module})"),
        (None, Some(module)) => format!("0x{:x} (in {module})", frame.offset),
        _ => format!("0x{:x}", frame.offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use symserver_common::ModuleKey;

    use crate::symbolication::{InlineFrame, ModuleState};

    fn result_with_frame(frame: SymbolicatedFrame) -> JobResult {
        JobResult {
            modules: vec![(
                ModuleKey::new("xul.pdb", "DEADBEEF").unwrap(),
                ModuleState::Found,
            )],
            stacks: vec![vec![frame]],
        }
    }

    #[test]
    fn renders_function_frames() {
        let result = result_with_frame(SymbolicatedFrame {
            module_index: Some(0),
            offset: 0x1234,
            function: Some("foo()".into()),
            ..Default::default()
        });
        assert_eq!(render(&result).symbolicated_stacks[0][0], "foo() (in xul.pdb)");
    }

    #[test]
    fn renders_innermost_inline_frame() {
        let result = result_with_frame(SymbolicatedFrame {
            module_index: Some(0),
            offset: 0x1234,
            function: Some("outer()".into()),
            inlines: vec![InlineFrame {
                function: "leaf()".into(),
                file: None,
                line: None,
            }],
            ..Default::default()
        });
        assert_eq!(render(&result).symbolicated_stacks[0][0], "leaf() (in xul.pdb)");
    }

    #[test]
    fn renders_unresolved_frames() {
        let result = result_with_frame(SymbolicatedFrame {
            module_index: Some(0),
            offset: 0x10,
            ..Default::default()
        });
        assert_eq!(render(&result).symbolicated_stacks[0][0], "0x10 (in xul.pdb)");
    }

    #[test]
    fn renders_moduleless_frames() {
        let result = result_with_frame(SymbolicatedFrame {
            module_index: None,
            offset: 0xdeadbeef,
            ..Default::default()
        });
        assert_eq!(render(&result).symbolicated_stacks[0][0], "0xdeadbeef");
    }
}
