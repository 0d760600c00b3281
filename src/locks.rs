//! 文件加锁：密码保护的文件只能凭密码获取下载链接。

use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{ApiJson, MessageResponse};
use crate::auth::AuthConfig;
use crate::error::ApiError;
use crate::files::caller_root;
use crate::keys;
use crate::objects::SharedObjectStore;
use crate::store::{LockRecord, MetadataStore};
use crate::token::Claims;

type HmacSha256 = Hmac<Sha256>;

#[derive(Deserialize)]
pub(crate) struct LockRequest {
    key: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedFile {
    pub key: String,
    pub redirect_key: String,
}

#[derive(Serialize)]
pub struct PasswordUrlResponse {
    pub url: String,
}

fn password_digest(salt: &str, password: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes()).expect("HMAC can take key of any size");
    mac.update(password.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn new_lock_record(object_key: String, owner_id: &str, password: &str) -> LockRecord {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = hex::encode(password_digest(&salt, password));
    LockRecord {
        object_key,
        owner_id: owner_id.to_string(),
        salt,
        digest,
    }
}

fn password_matches(record: &LockRecord, password: &str) -> bool {
    let Ok(expected) = hex::decode(&record.digest) else {
        return false;
    };
    password_digest(&record.salt, password).ct_eq(&expected).into()
}

/// 为文件设置访问密码。
pub async fn lock_file(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<LockRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    if payload.password.is_empty() {
        return Err(ApiError::BadRequest("password is required".into()));
    }
    let root = caller_root(&claims)?;
    let key = keys::normalize_file(&payload.key)?;
    let full_key = format!("{root}{key}");
    if !objects.exists(&full_key).await? {
        return Err(ApiError::NotFound("file not found".into()));
    }
    if store.locked_file(&full_key)?.is_some() {
        return Err(ApiError::Conflict("file is already locked".into()));
    }

    store.lock_file(&new_lock_record(full_key.clone(), &claims.id, &payload.password))?;
    info!(user = claims.id, key = full_key, "lock file");
    Ok(MessageResponse::new("File locked"))
}

/// 解除文件密码（需提供原密码）。
pub async fn unlock_file(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<LockRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let root = caller_root(&claims)?;
    let key = keys::normalize_file(&payload.key)?;
    let full_key = format!("{root}{key}");
    let Some(record) = store.locked_file(&full_key)? else {
        return Err(ApiError::NotFound("file is not locked".into()));
    };
    if !password_matches(&record, &payload.password) {
        return Err(ApiError::Unauthorized("Invalid password".into()));
    }
    store.unlock_file(&full_key)?;
    info!(user = claims.id, key = full_key, "unlock file");
    Ok(MessageResponse::new("File unlocked"))
}

/// 列出当前用户加锁的文件。
pub async fn get_locked_files(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
) -> Result<Json<Vec<LockedFile>>, ApiError> {
    let root = caller_root(&claims)?;
    let files = store
        .locked_files_of(&claims.id)?
        .into_iter()
        .filter_map(|record| {
            let key = keys::strip_root(&root, &record.object_key)?.to_string();
            Some(LockedFile {
                key,
                redirect_key: record.object_key,
            })
        })
        .collect();
    Ok(Json(files))
}

/// 校验文件密码，成功时返回预签名下载链接（无需登录）。
///
/// 失败次数按（客户端 IP, 对象键）限流。
pub async fn validate_password(
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<LockRequest>,
) -> Result<Json<PasswordUrlResponse>, ApiError> {
    let limiter_key = (auth.client_ip(&headers, addr), payload.key.clone());
    if let Some(retry_after) = auth.password_limiter.check(limiter_key.clone()).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    let Some(record) = store.locked_file(&payload.key)? else {
        return Err(ApiError::NotFound("file is not locked".into()));
    };
    if !password_matches(&record, &payload.password) {
        let (client_ip, key) = &limiter_key;
        warn!(client_ip = %client_ip, key, "invalid file password");
        if auth.password_limiter.register_failure(limiter_key.clone()).await {
            warn!(client_ip = %client_ip, key, "file password locked out");
        }
        return Err(ApiError::Unauthorized("Invalid password".into()));
    }

    auth.password_limiter.clear(&limiter_key).await;
    let url = objects.presign_get(&record.object_key).await?;
    Ok(Json(PasswordUrlResponse { url }))
}
