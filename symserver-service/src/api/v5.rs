//! The v5 symbolication API.
//!
//! A request carries up to `SYMBOLICATE_MAX_JOBS` jobs (or one bare job for
//! convenience). Frames come back as structured objects with inline
//! expansions, and each job reports which referenced modules were found.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::Serialize;

use crate::api::{convert_job, internal_error_response, require_body, RawJob, ValidationError};
use crate::metric;
use crate::server::AppState;
use crate::symbolication::{Job, JobResult, ModuleState, SymbolicatedFrame};

#[derive(Debug, Serialize)]
struct V5Response {
    results: Vec<V5JobResult>,
}

#[derive(Debug, Serialize)]
struct V5JobResult {
    stacks: Vec<Vec<V5Frame>>,
    found_modules: BTreeMap<String, bool>,
}

#[derive(Debug, Serialize)]
struct V5Frame {
    frame: usize,
    module_offset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    inlines: Vec<V5Inline>,
}

#[derive(Debug, Serialize)]
struct V5Inline {
    function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
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
    let jobs = match parse_jobs(&body, state.max_jobs) {
        Ok(jobs) => jobs,
        Err(error) => return error.into_response(),
    };

    let results = match state.symbolicator.symbolicate(jobs).await {
        Ok(results) => results,
        Err(error) => return internal_error_response(&error),
    };
    let response = V5Response {
        results: results.iter().map(render_job).collect(),
    };

    metric!(timer("symbolicate.api") = started.elapsed(), "version" => "v5");
    Json(response).into_response()
}

/// Parses the request body into validated jobs.
///
/// The body is either `{"jobs": [job, …]}` or a single bare job.
fn parse_jobs(body: &[u8], max_jobs: usize) -> Result<Vec<Job>, ValidationError> {
    let mut value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| ValidationError::new("invalid_json"))?;

    let raw_jobs: Vec<RawJob> = match value.get_mut("jobs") {
        Some(jobs) => serde_json::from_value(jobs.take())
            .map_err(|_| ValidationError::new("invalid_json"))?,
        None => vec![
            serde_json::from_value(value).map_err(|_| ValidationError::new("invalid_json"))?,
        ],
    };

    if raw_jobs.len() > max_jobs {
        return Err(ValidationError::new("too_many_jobs"));
    }

    raw_jobs.into_iter().map(convert_job).collect()
}

fn render_job(result: &JobResult) -> V5JobResult {
    let stacks = result
        .stacks
        .iter()
        .map(|stack| {
            stack
                .iter()
                .enumerate()
                .map(|(index, frame)| render_frame(index, frame, result))
                .collect()
        })
        .collect();

    // Modules that no frame referenced stay absent.
    let found_modules = result
        .modules
        .iter()
        .filter(|(_, state)| !matches!(state, ModuleState::Unused))
        .map(|(key, state)| (key.to_string(), state.found()))
        .collect();

    V5JobResult {
        stacks,
        found_modules,
    }
}

fn render_frame(index: usize, frame: &SymbolicatedFrame, result: &JobResult) -> V5Frame {
    let module = frame
        .module_index
        .and_then(|module_index| result.modules.get(module_index))
        .map(|(key, _)| key.debug_file().to_owned());

    V5Frame {
        frame: index,
        module_offset: format!("0x{:x}", frame.offset),
        module,
        function: frame.function.clone(),
        function_offset: frame
            .function_offset
            .map(|offset| format!("0x{offset:x}")),
        file: frame.file.clone(),
        line: frame.line,
        inlines: frame
            .inlines
            .iter()
            .map(|inline| V5Inline {
                function: inline.function.clone(),
                file: inline.file.clone(),
                line: inline.line,
            })
            .collect(),
    }
}
