//! Wire envelope and error mapping for the command endpoint.
//!
//! Every response, success or failure, is an HTTP 200 carrying a JSON
//! envelope `{"code": <int>, "data": <any>}`. Code 0 is success; failures
//! put a numeric error code in `code` and a human-readable message in
//! `data`. Clients dispatch on the envelope, not on the HTTP status.

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

/// Generic server-side failure.
pub const CODE_SYSTEM: i32 = 100;
/// Request arguments missing, malformed, or referencing an unknown target.
pub const CODE_BAD_ARGUMENTS: i32 = 1000;
/// Token missing, unparseable, or failed signature verification.
pub const CODE_BAD_TOKEN: i32 = 2001;

/// Success envelope with code 0 and the handler's payload.
pub fn ok_data(data: Value) -> Response {
    Json(json!({"code": 0, "data": data})).into_response()
}

/// Success envelope with code 0 and no payload.
pub fn ok_empty() -> Response {
    Json(json!({"code": 0, "data": Value::Null})).into_response()
}

#[derive(Debug, Serialize)]
struct Envelope {
    code: i32,
    data: String,
}

/// Error returned by command handlers, mapped onto the envelope.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("bad token: {0}")]
    BadToken(String),
    #[error(transparent)]
    System(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::BadArguments(message.into())
    }

    pub fn bad_token(message: impl Into<String>) -> Self {
        Self::BadToken(message.into())
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::BadArguments(_) => CODE_BAD_ARGUMENTS,
            Self::BadToken(_) => CODE_BAD_TOKEN,
            Self::System(_) => CODE_SYSTEM,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let data = match &self {
            Self::System(err) => format!("{err:#}"),
            other => other.to_string(),
        };
        Json(Envelope {
            code: self.code(),
            data,
        })
        .into_response()
    }
}
