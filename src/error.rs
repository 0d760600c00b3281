//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::extract::rejection::{FormRejection, JsonRejection, QueryRejection};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::identity::IdentityError;
use crate::keys::KeyError;
use crate::objects::ObjectStoreError;
use crate::store::StoreError;
use crate::token::TokenError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(u64),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

fn json_error(status: StatusCode, headers: HeaderMap, message: &str) -> Response {
    (status, headers, Json(ErrorBody { message })).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => json_error(StatusCode::BAD_REQUEST, HeaderMap::new(), &msg),
            ApiError::Unauthorized(msg) => {
                json_error(StatusCode::UNAUTHORIZED, HeaderMap::new(), &msg)
            }
            ApiError::Forbidden(msg) => json_error(StatusCode::FORBIDDEN, HeaderMap::new(), &msg),
            ApiError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, HeaderMap::new(), &msg),
            ApiError::Conflict(msg) => json_error(StatusCode::CONFLICT, HeaderMap::new(), &msg),
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                json_error(StatusCode::TOO_MANY_REQUESTS, headers, "too many requests")
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    HeaderMap::new(),
                    "internal server error",
                )
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<ObjectStoreError> for ApiError {
    fn from(error: ObjectStoreError) -> Self {
        match error {
            ObjectStoreError::NotFound(key) => ApiError::NotFound(format!("object not found: {key}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<FormRejection> for ApiError {
    fn from(rejection: FormRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<KeyError> for ApiError {
    fn from(error: KeyError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl From<TokenError> for ApiError {
    fn from(_: TokenError) -> Self {
        ApiError::Unauthorized("Invalid token".into())
    }
}

impl From<IdentityError> for ApiError {
    fn from(error: IdentityError) -> Self {
        match error {
            IdentityError::Transport(msg) => ApiError::Internal(msg),
            _ => ApiError::Unauthorized("Invalid token".into()),
        }
    }
}
