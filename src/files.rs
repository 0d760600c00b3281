//! 用户文件列表、预签名 URL、删除与目录创建处理器。

use axum::extract::{Extension, Json};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{ApiJson, ApiQuery};
use crate::error::ApiError;
use crate::keys;
use crate::objects::{SharedObjectStore, delete_all, expand_keys};
use crate::store::MetadataStore;
use crate::token::Claims;
use crate::tree::{FileFilter, FileRecord, FilterQuery, Tree, build_tree};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStructureResponse {
    pub file_structure: Vec<FileRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadUrlRequest {
    pub(crate) key: String,
    pub(crate) content_type: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct KeyRequest {
    pub(crate) key: String,
}

#[derive(Serialize)]
pub struct UrlResponse {
    pub url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeleteObjectsRequest {
    pub(crate) objects_to_delete: Vec<String>,
}

#[derive(Serialize)]
pub struct DeleteObjectsResponse {
    pub deleted: usize,
}

#[derive(Deserialize)]
pub(crate) struct CreateFolderRequest {
    #[serde(default)]
    pub(crate) key: String,
    pub(crate) name: String,
}

#[derive(Serialize)]
pub struct CreatedKeyResponse {
    pub key: String,
}

pub(crate) fn caller_root(claims: &Claims) -> Result<String, ApiError> {
    Ok(keys::user_root(&claims.id)?)
}

/// 列出 `root` 下的文件记录并应用过滤条件。
pub(crate) async fn list_records(
    objects: &SharedObjectStore,
    root: &str,
    filter: &FileFilter,
) -> Result<Vec<FileRecord>, ApiError> {
    let entries = objects.list(root).await?;
    Ok(filter.apply(FileRecord::from_entries(root, entries)))
}

pub(crate) fn parse_filter(query: &FilterQuery) -> Result<FileFilter, ApiError> {
    FileFilter::from_query(query).map_err(ApiError::BadRequest)
}

/// 为 `root` 下的 `raw_key` 签发上传 URL；加锁文件不可覆盖。
pub(crate) async fn presign_upload(
    objects: &SharedObjectStore,
    store: &MetadataStore,
    root: &str,
    raw_key: &str,
    content_type: Option<&str>,
) -> Result<String, ApiError> {
    let key = keys::normalize_file(raw_key)?;
    let full_key = format!("{root}{key}");
    if store.locked_file(&full_key)?.is_some() {
        return Err(ApiError::Conflict("file is locked".into()));
    }
    let content_type = match content_type.map(str::trim).filter(|t| !t.is_empty()) {
        Some(value) => value.to_string(),
        None => mime_guess::from_path(&key)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    };
    let url = objects.presign_put(&full_key, &content_type).await?;
    info!(key = full_key, content_type, "issued upload url");
    Ok(url)
}

/// 为 `root` 下已存在且未加锁的文件签发下载 URL。
pub(crate) async fn presign_download(
    objects: &SharedObjectStore,
    store: &MetadataStore,
    root: &str,
    raw_key: &str,
) -> Result<String, ApiError> {
    let key = keys::normalize_file(raw_key)?;
    let full_key = format!("{root}{key}");
    if store.locked_file(&full_key)?.is_some() {
        return Err(ApiError::Forbidden("file is locked".into()));
    }
    if !objects.exists(&full_key).await? {
        return Err(ApiError::NotFound("file not found".into()));
    }
    Ok(objects.presign_get(&full_key).await?)
}

/// 删除 `root` 下的相对键，目录连同其内容一起删除；已删除对象的加锁与共享记录同步清理。
pub(crate) async fn delete_under_root(
    objects: &SharedObjectStore,
    store: &MetadataStore,
    root: &str,
    raw_keys: &[String],
) -> Result<usize, ApiError> {
    if raw_keys.is_empty() {
        return Err(ApiError::BadRequest("objectsToDelete is empty".into()));
    }
    let full_keys = raw_keys
        .iter()
        .map(|raw| keys::normalize_entry(raw).map(|key| format!("{root}{key}")))
        .collect::<Result<Vec<_>, _>>()?;

    let expanded = expand_keys(objects.as_ref(), &full_keys).await?;
    let report = delete_all(objects.as_ref(), &expanded).await;
    store.forget_objects(&report.deleted)?;
    if !report.failed.is_empty() {
        warn!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "partial delete"
        );
        return Err(ApiError::Internal(format!(
            "failed to delete {} of {} objects",
            report.failed.len(),
            expanded.len()
        )));
    }
    Ok(report.deleted.len())
}

/// 在 `parent` 中创建目录 `name` 的占位对象。
pub(crate) async fn create_folder_under_root(
    objects: &SharedObjectStore,
    root: &str,
    parent: &str,
    name: &str,
) -> Result<String, ApiError> {
    let marker = keys::folder_marker(parent, name)?;
    let full_key = format!("{root}{marker}");
    if objects.exists(&full_key).await? {
        return Err(ApiError::Conflict("folder already exists".into()));
    }
    objects.put_empty(&full_key).await?;
    Ok(marker)
}

/// 列出当前用户的全部文件（支持过滤与搜索）。
pub async fn get_file_structure(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    ApiQuery(query): ApiQuery<FilterQuery>,
) -> Result<Json<FileStructureResponse>, ApiError> {
    let root = caller_root(&claims)?;
    let filter = parse_filter(&query)?;
    let file_structure = list_records(&objects, &root, &filter).await?;
    info!(user = claims.id, count = file_structure.len(), "list files");
    Ok(Json(FileStructureResponse { file_structure }))
}

/// 以目录树形式返回当前用户的文件。
pub async fn get_file_tree(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    ApiQuery(query): ApiQuery<FilterQuery>,
) -> Result<Json<Tree>, ApiError> {
    let root = caller_root(&claims)?;
    let filter = parse_filter(&query)?;
    let records = list_records(&objects, &root, &filter).await?;
    Ok(Json(build_tree(&records)))
}

/// 获取上传用的预签名 URL。
pub async fn get_upload_url(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<UploadUrlRequest>,
) -> Result<Json<String>, ApiError> {
    let root = caller_root(&claims)?;
    let url = presign_upload(
        &objects,
        &store,
        &root,
        &payload.key,
        payload.content_type.as_deref(),
    )
    .await?;
    Ok(Json(url))
}

/// 获取下载用的预签名 URL（加锁文件需走密码校验）。
pub async fn get_download_url(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<KeyRequest>,
) -> Result<Json<UrlResponse>, ApiError> {
    let root = caller_root(&claims)?;
    let url = presign_download(&objects, &store, &root, &payload.key).await?;
    Ok(Json(UrlResponse { url }))
}

/// 删除文件或目录。
pub async fn delete_objects(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<DeleteObjectsRequest>,
) -> Result<Json<DeleteObjectsResponse>, ApiError> {
    let root = caller_root(&claims)?;
    let deleted = delete_under_root(&objects, &store, &root, &payload.objects_to_delete).await?;
    info!(user = claims.id, deleted, "delete objects");
    Ok(Json(DeleteObjectsResponse { deleted }))
}

/// 创建目录。
pub async fn create_folder(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    ApiJson(payload): ApiJson<CreateFolderRequest>,
) -> Result<(StatusCode, Json<CreatedKeyResponse>), ApiError> {
    let root = caller_root(&claims)?;
    let key = create_folder_under_root(&objects, &root, &payload.key, &payload.name).await?;
    info!(user = claims.id, key, "create folder");
    Ok((StatusCode::CREATED, Json(CreatedKeyResponse { key })))
}
