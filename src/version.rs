//! 版本信息与根路径欢迎语。

use axum::response::Json as JsonResponse;
use serde::Serialize;

use crate::error::ApiError;

pub const WELCOME_MESSAGE: &str = "Welcome to the CRUxDrive API";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    commit: &'static str,
    build_time: &'static str,
    build_env: String,
}

/// 根路径，用于存活探测。
pub async fn welcome() -> &'static str {
    WELCOME_MESSAGE
}

/// 返回当前版本信息。
pub async fn get_version_info() -> Result<JsonResponse<VersionInfo>, ApiError> {
    let version_info = VersionInfo {
        version: crate::build::PKG_VERSION,
        commit: crate::build::SHORT_COMMIT,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
    };
    Ok(JsonResponse(version_info))
}
