//! 文件/目录共享。

use axum::extract::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::api::ApiJson;
use crate::error::ApiError;
use crate::files::{FileStructureResponse, KeyRequest, UrlResponse, caller_root};
use crate::keys;
use crate::objects::SharedObjectStore;
use crate::store::{MetadataStore, ShareRecord, normalize_email};
use crate::token::Claims;
use crate::tree::FileRecord;

#[derive(Deserialize)]
pub(crate) struct ShareRequest {
    keys: Vec<String>,
    email: String,
}

#[derive(Serialize)]
pub struct ShareResponse {
    pub changed: usize,
}

fn share_target(claims: &Claims, payload: &ShareRequest) -> Result<String, ApiError> {
    if payload.keys.is_empty() {
        return Err(ApiError::BadRequest("keys is empty".into()));
    }
    let email = normalize_email(&payload.email);
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::BadRequest("invalid email".into()));
    }
    if email == normalize_email(&claims.email) {
        return Err(ApiError::BadRequest("cannot share with yourself".into()));
    }
    Ok(email)
}

/// 共享自己的文件或目录给指定邮箱。
pub async fn share_objects(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<ShareRequest>,
) -> Result<Json<ShareResponse>, ApiError> {
    let email = share_target(&claims, &payload)?;
    let root = caller_root(&claims)?;

    let mut changed = 0;
    for raw in &payload.keys {
        let full_key = format!("{root}{}", keys::normalize_entry(raw)?);
        let exists = if keys::is_folder(&full_key) {
            !objects.list(&full_key).await?.is_empty()
        } else {
            objects.exists(&full_key).await?
        };
        if !exists {
            return Err(ApiError::NotFound(format!("{raw} not found")));
        }
        let record = ShareRecord {
            object_key: full_key,
            owner_id: claims.id.clone(),
            owner_email: normalize_email(&claims.email),
            shared_with: email.clone(),
        };
        if store.add_share(&record)? {
            changed += 1;
        }
    }

    info!(user = claims.id, with = email, changed, "share objects");
    Ok(Json(ShareResponse { changed }))
}

/// 取消共享。
pub async fn unshare_objects(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<ShareRequest>,
) -> Result<Json<ShareResponse>, ApiError> {
    let email = share_target(&claims, &payload)?;
    let root = caller_root(&claims)?;

    let mut changed = 0;
    for raw in &payload.keys {
        let full_key = format!("{root}{}", keys::normalize_entry(raw)?);
        if store.remove_share(&full_key, &claims.id, &email)? {
            changed += 1;
        }
    }

    info!(user = claims.id, with = email, changed, "unshare objects");
    Ok(Json(ShareResponse { changed }))
}

/// 列出共享给我的文件；键名以共享者邮箱开头。
pub async fn get_shared_files_folders(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
) -> Result<Json<FileStructureResponse>, ApiError> {
    let mut file_structure: Vec<FileRecord> = Vec::new();
    for share in store.shares_with(&claims.email)? {
        let owner_root = keys::user_root(&share.owner_id)?;
        let label = format!("{}/", share.owner_email);
        let mut entries = objects.list(&share.object_key).await?;
        if !keys::is_folder(&share.object_key) {
            entries.retain(|entry| entry.key == share.object_key);
        }
        for record in FileRecord::from_entries_with_label(&owner_root, &label, entries) {
            if !file_structure
                .iter()
                .any(|existing| existing.redirect_key == record.redirect_key)
            {
                file_structure.push(record);
            }
        }
    }
    Ok(Json(FileStructureResponse { file_structure }))
}

/// 获取共享文件的下载链接；`key` 为完整对象键。
pub async fn get_shared_download_url(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<KeyRequest>,
) -> Result<Json<UrlResponse>, ApiError> {
    let key = keys::normalize_file(&payload.key)?;
    if !store.is_shared_with(&key, &claims.email)? {
        return Err(ApiError::Forbidden("not shared with you".into()));
    }
    if store.locked_file(&key)?.is_some() {
        return Err(ApiError::Forbidden("file is locked".into()));
    }
    if !objects.exists(&key).await? {
        return Err(ApiError::NotFound("file not found".into()));
    }
    let url = objects.presign_get(&key).await?;
    Ok(Json(UrlResponse { url }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::files::tests::claims;
    use crate::objects::memory::MemoryObjectStore;

    fn setup() -> (SharedObjectStore, Arc<MetadataStore>) {
        (
            Arc::new(MemoryObjectStore::with_keys(&[
                ("users/1/docs/", 0),
                ("users/1/docs/a.txt", 3),
                ("users/1/docs/sub/b.txt", 4),
                ("users/1/notes.txt", 5),
                ("users/1/notes.txt.bak", 5),
            ])),
            Arc::new(MetadataStore::in_memory().unwrap()),
        )
    }

    fn alice() -> Claims {
        claims("1", "Alice@x.in")
    }

    fn bob() -> Claims {
        claims("2", "bob@x.in")
    }

    fn request(keys: &[&str], email: &str) -> ApiJson<ShareRequest> {
        ApiJson(ShareRequest {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            email: email.into(),
        })
    }

    #[tokio::test]
    async fn shared_folder_and_file_are_listed_with_owner_label() {
        let (objects, store) = setup();
        let Json(response) = share_objects(
            Extension(alice()),
            Extension(objects.clone()),
            Extension(store.clone()),
            request(&["docs/", "notes.txt", "notes.txt"], "Bob@x.in"),
        )
        .await
        .unwrap();
        assert_eq!(response.changed, 2);

        let Json(listing) = get_shared_files_folders(
            Extension(bob()),
            Extension(objects),
            Extension(store),
        )
        .await
        .unwrap();
        let keys: Vec<_> = listing.file_structure.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "alice@x.in/docs/",
                "alice@x.in/docs/a.txt",
                "alice@x.in/docs/sub/b.txt",
                "alice@x.in/notes.txt",
            ]
        );
        assert_eq!(listing.file_structure[3].redirect_key, "users/1/notes.txt");
    }

    #[tokio::test]
    async fn share_rejects_missing_keys_and_self() {
        let (objects, store) = setup();
        let missing = share_objects(
            Extension(alice()),
            Extension(objects.clone()),
            Extension(store.clone()),
            request(&["nope.txt"], "bob@x.in"),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));

        let own = share_objects(
            Extension(alice()),
            Extension(objects),
            Extension(store),
            request(&["notes.txt"], "alice@x.in"),
        )
        .await;
        assert!(matches!(own, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn download_requires_covering_share() {
        let (objects, store) = setup();
        share_objects(
            Extension(alice()),
            Extension(objects.clone()),
            Extension(store.clone()),
            request(&["docs/"], "bob@x.in"),
        )
        .await
        .unwrap();

        let Json(response) = get_shared_download_url(
            Extension(bob()),
            Extension(objects.clone()),
            Extension(store.clone()),
            ApiJson(KeyRequest {
                key: "users/1/docs/sub/b.txt".into(),
            }),
        )
        .await
        .unwrap();
        assert!(response.url.contains("users/1/docs/sub/b.txt"));

        let outside = get_shared_download_url(
            Extension(bob()),
            Extension(objects.clone()),
            Extension(store.clone()),
            ApiJson(KeyRequest {
                key: "users/1/notes.txt".into(),
            }),
        )
        .await;
        assert!(matches!(outside, Err(ApiError::Forbidden(_))));

        let Json(removed) = unshare_objects(
            Extension(alice()),
            Extension(store.clone()),
            request(&["docs/"], "bob@x.in"),
        )
        .await
        .unwrap();
        assert_eq!(removed.changed, 1);

        let revoked = get_shared_download_url(
            Extension(bob()),
            Extension(objects),
            Extension(store),
            ApiJson(KeyRequest {
                key: "users/1/docs/a.txt".into(),
            }),
        )
        .await;
        assert!(matches!(revoked, Err(ApiError::Forbidden(_))));
    }
}
