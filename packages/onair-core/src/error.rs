//! Centralized error types for the OnAir core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::codec::CodecError;
use crate::services::store::StoreError;
use crate::services::traits::{MixerError, PlaybackError, PreparationError};

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the OnAir server.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum OnAirError {
    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The group selection resolved to no active speaker.
    #[error("No active speakers for channel {0}")]
    NoActiveSpeakers(u32),

    /// No live session exists for the broadcast.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Mixer call failed.
    #[error("Mixer error: {0}")]
    Mixer(String),

    /// Media or TTS player call failed.
    #[error("Playback error: {0}")]
    Playback(String),

    /// Reading or writing persisted broadcast state failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Audio frame codec failure.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Server configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl OnAirError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NoActiveSpeakers(_) => "no_active_speakers",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Mixer(_) => "mixer_error",
            Self::Playback(_) => "playback_error",
            Self::Persistence(_) => "persistence_error",
            Self::Codec(_) => "codec_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoActiveSpeakers(_) => StatusCode::CONFLICT,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type OnAirResult<T> = Result<T, OnAirError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for OnAirError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<CodecError> for OnAirError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<MixerError> for OnAirError {
    fn from(err: MixerError) -> Self {
        Self::Mixer(err.to_string())
    }
}

impl From<PlaybackError> for OnAirError {
    fn from(err: PlaybackError) -> Self {
        Self::Playback(err.to_string())
    }
}

impl From<StoreError> for OnAirError {
    fn from(err: StoreError) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<PreparationError> for OnAirError {
    fn from(err: PreparationError) -> Self {
        match err {
            PreparationError::UnknownChannel(id) => {
                Self::InvalidRequest(format!("unknown channel {}", id))
            }
        }
    }
}
