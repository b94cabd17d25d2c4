//! HTTP request handlers

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::capture::SourceMedia;
use crate::encode::OutputFormat;
use crate::error::ExtractError;
use crate::pipeline::ExtractionReport;
use crate::progress::Progress;
use crate::state::AppState;

pub const X_EXTRACTION_ID: HeaderName = HeaderName::from_static("x-extraction-id");
pub const X_STOP_REASON: HeaderName = HeaderName::from_static("x-stop-reason");
pub const X_EXTRACTION_WARNING: HeaderName = HeaderName::from_static("x-extraction-warning");

/// HTTP error type
#[derive(Debug)]
pub struct HttpError(ExtractError);

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ExtractError::Busy => StatusCode::CONFLICT,
            ExtractError::MediaLoad(_) | ExtractError::Capture(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ExtractError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ExtractError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.0.kind(),
            "stage": self.0.stage(),
            "message": self.0.user_message(),
        });

        (self.status(), Json(body)).into_response()
    }
}

impl From<ExtractError> for HttpError {
    fn from(err: ExtractError) -> Self {
        HttpError(err)
    }
}

/// Query string of `POST /extract`
#[derive(Debug, Default, Deserialize)]
pub struct ExtractParams {
    pub format: Option<String>,
    pub name: Option<String>,
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Version endpoint
pub async fn version_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "ffmpeg": crate::ffmpeg::version_info(),
        "uptime_secs": state.uptime_secs(),
    }))
}

/// Progress of the current (or last) extraction
/// GET /progress
pub async fn progress(State(state): State<Arc<AppState>>) -> Json<Progress> {
    Json(state.extractor.current_progress())
}

/// Extraction endpoint
/// POST /extract?format=mp3|wav|webm&name=<display name>
///
/// The request body is the source file. The extraction is cancelled when the
/// client goes away before it finishes.
pub async fn extract(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExtractParams>,
    body: Bytes,
) -> Result<Response, HttpError> {
    let format = match params.format.as_deref() {
        Some(format) => format.parse::<OutputFormat>()?,
        None => OutputFormat::Mp3,
    };
    let source = SourceMedia::new(body, params.name.unwrap_or_default());

    // The extraction runs on its own task so that a client disconnect, which
    // drops this future, cancels it instead of abandoning it mid-stage.
    let extractor = Arc::clone(&state.extractor);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let report = tokio::spawn(async move {
        extractor.extract_with_cancel(source, format, cancel).await
    })
    .await
    .map_err(ExtractError::from)??;
    guard.disarm();

    Ok(report_response(report))
}

fn report_response(report: ExtractionReport) -> Response {
    let output = report.output;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(output.mime_type),
    );
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&output.suggested_filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&report.id.to_string()) {
        headers.insert(X_EXTRACTION_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&report.stop_reason.to_string()) {
        headers.insert(X_STOP_REASON, value);
    }
    for warning in &output.warnings {
        if let Ok(value) = HeaderValue::from_str(&header_safe(&warning.to_string())) {
            headers.append(X_EXTRACTION_WARNING, value);
        }
    }

    (StatusCode::OK, headers, output.bytes).into_response()
}

/// `attachment; filename="..."` with characters a header cannot carry replaced.
pub fn content_disposition(filename: &str) -> String {
    let name: String = header_safe(filename)
        .chars()
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect();
    format!("attachment; filename=\"{}\"", name)
}

fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(HttpError(ExtractError::Busy).status(), StatusCode::CONFLICT);
        assert_eq!(
            HttpError(ExtractError::MediaLoad("x".into())).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            HttpError(ExtractError::Capture("x".into())).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            HttpError(ExtractError::Cancelled).status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            HttpError(ExtractError::Config("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HttpError(ExtractError::Decode("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("clip_audio.mp3"),
            "attachment; filename=\"clip_audio.mp3\""
        );
        assert_eq!(
            content_disposition("a\"b\\c_audio.wav"),
            "attachment; filename=\"a_b_c_audio.wav\""
        );
        assert_eq!(
            content_disposition("café_audio.mp3"),
            "attachment; filename=\"caf__audio.mp3\""
        );
    }

    #[tokio::test]
    async fn test_error_body_is_json() {
        let response = HttpError(ExtractError::Busy).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "busy");
        assert_eq!(value["stage"], "setup");
    }
}
