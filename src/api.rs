//! 请求提取器与通用响应体：解析失败统一返回 `{"message"}` JSON。

use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::header;
use axum::http::request::Parts;
use axum::{Form, Json};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// JSON 请求体；反序列化失败时返回 400 JSON 错误。
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// 同时接受 JSON 与 `application/x-www-form-urlencoded` 的请求体。
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonOrForm<T>(pub T);

impl<T, S> FromRequest<S> for JsonOrForm<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));
        if is_form {
            let Form(value) = Form::<T>::from_request(req, state).await?;
            return Ok(Self(value));
        }
        let ApiJson(value) = ApiJson::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// 查询参数；解析失败时返回 400 JSON 错误。
#[derive(Debug, Clone, Default)]
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Payload {
        token: String,
    }

    fn request(content_type: &str, body: &'static str) -> Request {
        axum::http::Request::post("/")
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn missing_field_is_a_json_bad_request() {
        let rejection = ApiJson::<Payload>::from_request(request("application/json", "{}"), &())
            .await
            .unwrap_err();
        assert!(matches!(rejection, ApiError::BadRequest(_)));
        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn malformed_query_is_a_json_bad_request() {
        #[derive(Debug, Deserialize)]
        struct Sizes {
            #[serde(rename = "minSize")]
            _min_size: Option<u64>,
        }

        let (mut parts, _) = axum::http::Request::get("/?minSize=big")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let rejection = ApiQuery::<Sizes>::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert!(matches!(rejection, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn form_bodies_are_accepted() {
        let JsonOrForm(payload) = JsonOrForm::<Payload>::from_request(
            request("application/x-www-form-urlencoded", "token=abc"),
            &(),
        )
        .await
        .unwrap();
        assert_eq!(payload.token, "abc");

        let JsonOrForm(payload) =
            JsonOrForm::<Payload>::from_request(request("application/json", r#"{"token":"x"}"#), &())
                .await
                .unwrap();
        assert_eq!(payload.token, "x");
    }
}
