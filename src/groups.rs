//! 群组：创建、加入/退出、成员管理与群组文件操作。

use axum::extract::{Extension, Json};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::api::{ApiJson, MessageResponse};
use crate::error::ApiError;
use crate::files::{
    CreatedKeyResponse, DeleteObjectsResponse, FileStructureResponse, UrlResponse, caller_root,
    create_folder_under_root, delete_under_root, list_records, presign_download, presign_upload,
};
use crate::keys;
use crate::objects::{SharedObjectStore, expand_keys};
use crate::store::{Group, MetadataStore, normalize_email};
use crate::token::Claims;
use crate::tree::FileFilter;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateGroupRequest {
    group_name: String,
    #[serde(default)]
    is_public: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupResponse {
    pub group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupIdRequest {
    group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LeaveGroupRequest {
    id_to_be_removed: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AddEmailRequest {
    group_id: String,
    email: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupFolderRequest {
    group_id: String,
    #[serde(default)]
    key: String,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupDeleteRequest {
    group_id: String,
    objects_to_delete: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupUploadRequest {
    group_id: String,
    key: String,
    content_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupKeyRequest {
    group_id: String,
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CopyToGroupRequest {
    group_id: String,
    keys: Vec<String>,
    #[serde(default)]
    destination: String,
}

#[derive(Serialize)]
pub struct CopyToGroupResponse {
    pub copied: usize,
    pub skipped: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    /// 群主、成员，或任何人（公开群组）。
    Read,
    /// 仅群主与成员。
    Member,
    Owner,
}

/// 读取群组并校验调用者是否具备 `access` 权限。
fn authorize(
    store: &MetadataStore,
    group_id: &str,
    claims: &Claims,
    access: Access,
) -> Result<Group, ApiError> {
    let group = store
        .get_group(group_id)?
        .ok_or_else(|| ApiError::NotFound("group not found".into()))?;
    let is_owner = group.owner_id == claims.id;
    let allowed = match access {
        Access::Owner => is_owner,
        Access::Member => is_owner || store.is_member(group_id, &claims.email)?,
        Access::Read => {
            is_owner || group.is_public || store.is_member(group_id, &claims.email)?
        }
    };
    if !allowed {
        return Err(ApiError::Forbidden("not allowed for this group".into()));
    }
    Ok(group)
}

/// 创建群组。
pub async fn create_group(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<CreateGroupRequest>,
) -> Result<(StatusCode, Json<CreateGroupResponse>), ApiError> {
    let name = payload.group_name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("groupName is required".into()));
    }
    let group = Group {
        group_id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        owner: normalize_email(&claims.email),
        owner_id: claims.id.clone(),
        is_public: payload.is_public,
    };
    store.create_group(&group)?;
    info!(user = claims.id, group = group.group_id, is_public = group.is_public, "create group");
    Ok((
        StatusCode::CREATED,
        Json(CreateGroupResponse {
            group_id: group.group_id,
        }),
    ))
}

/// 我创建的群组。
pub async fn get_my_groups(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
) -> Result<Json<Vec<Group>>, ApiError> {
    Ok(Json(store.groups_owned_by(&claims.id)?))
}

/// 我加入的群组。
pub async fn get_joined_groups(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
) -> Result<Json<Vec<Group>>, ApiError> {
    Ok(Json(store.groups_joined_by(&claims.email)?))
}

/// 所有公开群组。
pub async fn get_public_groups(
    Extension(store): Extension<Arc<MetadataStore>>,
) -> Result<Json<Vec<Group>>, ApiError> {
    Ok(Json(store.public_groups()?))
}

/// 加入公开群组。
pub async fn join_group(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<GroupIdRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let group = store
        .get_group(&payload.group_id)?
        .ok_or_else(|| ApiError::NotFound("group not found".into()))?;
    if !group.is_public {
        return Err(ApiError::Forbidden("group is private".into()));
    }
    if group.owner_id == claims.id {
        return Err(ApiError::Conflict("owner is already in the group".into()));
    }
    let added = store.add_member(&group.group_id, &claims.email)?;
    info!(user = claims.id, group = group.group_id, added, "join group");
    Ok(MessageResponse::new("Joined group"))
}

/// 退出群组（群主不能退出）。
pub async fn leave_group(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<LeaveGroupRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let group = store
        .get_group(&payload.id_to_be_removed)?
        .ok_or_else(|| ApiError::NotFound("group not found".into()))?;
    if group.owner_id == claims.id {
        return Err(ApiError::Conflict("owner cannot leave the group".into()));
    }
    if !store.remove_member(&group.group_id, &claims.email)? {
        return Err(ApiError::NotFound("not a member of this group".into()));
    }
    info!(user = claims.id, group = group.group_id, "leave group");
    Ok(MessageResponse::new("Left group"))
}

/// 群主按邮箱添加成员。
pub async fn add_email_to_group(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<AddEmailRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let group = authorize(&store, &payload.group_id, &claims, Access::Owner)?;
    let email = normalize_email(&payload.email);
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::BadRequest("invalid email".into()));
    }
    if email == group.owner {
        return Err(ApiError::Conflict("owner is already in the group".into()));
    }
    let added = store.add_member(&group.group_id, &email)?;
    info!(user = claims.id, group = group.group_id, member = email, added, "add group member");
    Ok(MessageResponse::new("Member added"))
}

#[derive(Serialize)]
pub struct GroupMembersResponse {
    pub owner: String,
    pub members: Vec<String>,
}

/// 群组成员列表。
pub async fn get_group_members(
    Extension(claims): Extension<Claims>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<GroupIdRequest>,
) -> Result<Json<GroupMembersResponse>, ApiError> {
    let group = authorize(&store, &payload.group_id, &claims, Access::Read)?;
    let members = store.members(&group.group_id)?;
    Ok(Json(GroupMembersResponse {
        owner: group.owner,
        members,
    }))
}

/// 群组文件列表。
pub async fn get_group_file_structure(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<GroupIdRequest>,
) -> Result<Json<FileStructureResponse>, ApiError> {
    let group = authorize(&store, &payload.group_id, &claims, Access::Read)?;
    let root = keys::group_root(&group.group_id)?;
    let file_structure = list_records(&objects, &root, &FileFilter::default()).await?;
    Ok(Json(FileStructureResponse { file_structure }))
}

/// 在群组中创建目录。
pub async fn create_group_folder(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<GroupFolderRequest>,
) -> Result<(StatusCode, Json<CreatedKeyResponse>), ApiError> {
    let group = authorize(&store, &payload.group_id, &claims, Access::Member)?;
    let root = keys::group_root(&group.group_id)?;
    let key = create_folder_under_root(&objects, &root, &payload.key, &payload.name).await?;
    info!(user = claims.id, group = group.group_id, key, "create group folder");
    Ok((StatusCode::CREATED, Json(CreatedKeyResponse { key })))
}

/// 删除群组中的文件或目录。
pub async fn delete_objects_in_group(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<GroupDeleteRequest>,
) -> Result<Json<DeleteObjectsResponse>, ApiError> {
    let group = authorize(&store, &payload.group_id, &claims, Access::Member)?;
    let root = keys::group_root(&group.group_id)?;
    let deleted = delete_under_root(&objects, &store, &root, &payload.objects_to_delete).await?;
    info!(user = claims.id, group = group.group_id, deleted, "delete group objects");
    Ok(Json(DeleteObjectsResponse { deleted }))
}

/// 群组上传预签名 URL。
pub async fn get_group_upload_url(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<GroupUploadRequest>,
) -> Result<Json<String>, ApiError> {
    let group = authorize(&store, &payload.group_id, &claims, Access::Member)?;
    let root = keys::group_root(&group.group_id)?;
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

/// 群组下载预签名 URL。
pub async fn get_group_download_url(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<GroupKeyRequest>,
) -> Result<Json<UrlResponse>, ApiError> {
    let group = authorize(&store, &payload.group_id, &claims, Access::Member)?;
    let root = keys::group_root(&group.group_id)?;
    let url = presign_download(&objects, &store, &root, &payload.key).await?;
    Ok(Json(UrlResponse { url }))
}

/// 把自己的文件/目录复制到群组目录；加锁文件会被跳过。
pub async fn copy_objects_to_group(
    Extension(claims): Extension<Claims>,
    Extension(objects): Extension<SharedObjectStore>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ApiJson(payload): ApiJson<CopyToGroupRequest>,
) -> Result<Json<CopyToGroupResponse>, ApiError> {
    let group = authorize(&store, &payload.group_id, &claims, Access::Member)?;
    if payload.keys.is_empty() {
        return Err(ApiError::BadRequest("keys is empty".into()));
    }
    let source_root = caller_root(&claims)?;
    let target_root = format!(
        "{}{}",
        keys::group_root(&group.group_id)?,
        keys::normalize_folder(&payload.destination)?
    );

    let mut copied = 0;
    let mut skipped = 0;
    for raw in &payload.keys {
        let key = keys::normalize_entry(raw)?;
        let base = format!("{source_root}{}", keys::parent_prefix(&key));
        let full_key = format!("{source_root}{key}");
        for source in expand_keys(objects.as_ref(), &[full_key]).await? {
            if store.locked_file(&source)?.is_some() {
                skipped += 1;
                continue;
            }
            let Some(suffix) = source.strip_prefix(&base) else {
                continue;
            };
            let target = format!("{target_root}{suffix}");
            if keys::is_folder(&source) {
                objects.put_empty(&target).await?;
            } else {
                objects.copy(&source, &target).await?;
            }
            copied += 1;
        }
    }

    info!(user = claims.id, group = group.group_id, copied, skipped, "copy objects to group");
    Ok(Json(CopyToGroupResponse { copied, skipped }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::files::tests::claims;
    use crate::objects::memory::MemoryObjectStore;

    struct Fixture {
        memory: Arc<MemoryObjectStore>,
        objects: SharedObjectStore,
        store: Arc<MetadataStore>,
    }

    fn fixture(keys: &[(&str, u64)]) -> Fixture {
        let memory = Arc::new(MemoryObjectStore::with_keys(keys));
        Fixture {
            objects: memory.clone(),
            memory,
            store: Arc::new(MetadataStore::in_memory().unwrap()),
        }
    }

    fn owner() -> Claims {
        claims("1", "owner@x.in")
    }

    fn member() -> Claims {
        claims("2", "member@x.in")
    }

    fn stranger() -> Claims {
        claims("3", "stranger@x.in")
    }

    async fn new_group(fx: &Fixture, is_public: bool) -> String {
        let (_, Json(created)) = create_group(
            Extension(owner()),
            Extension(fx.store.clone()),
            ApiJson(CreateGroupRequest {
                group_name: "Study".into(),
                is_public,
            }),
        )
        .await
        .unwrap();
        created.group_id
    }

    #[tokio::test]
    async fn owner_adds_member_by_email() {
        let fx = fixture(&[]);
        let group_id = new_group(&fx, false).await;

        let denied = add_email_to_group(
            Extension(member()),
            Extension(fx.store.clone()),
            ApiJson(AddEmailRequest {
                group_id: group_id.clone(),
                email: "member@x.in".into(),
            }),
        )
        .await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        add_email_to_group(
            Extension(owner()),
            Extension(fx.store.clone()),
            ApiJson(AddEmailRequest {
                group_id: group_id.clone(),
                email: "Member@X.in".into(),
            }),
        )
        .await
        .unwrap();

        let Json(joined) = get_joined_groups(Extension(member()), Extension(fx.store.clone()))
            .await
            .unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].owner, "owner@x.in");

        let Json(mine) = get_my_groups(Extension(owner()), Extension(fx.store.clone()))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);

        let Json(roster) = get_group_members(
            Extension(member()),
            Extension(fx.store.clone()),
            ApiJson(GroupIdRequest { group_id }),
        )
        .await
        .unwrap();
        assert_eq!(roster.owner, "owner@x.in");
        assert_eq!(roster.members, vec!["member@x.in".to_string()]);
    }

    #[tokio::test]
    async fn private_groups_cannot_be_joined() {
        let fx = fixture(&[]);
        let group_id = new_group(&fx, false).await;
        let result = join_group(
            Extension(stranger()),
            Extension(fx.store.clone()),
            ApiJson(GroupIdRequest { group_id }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn join_and_leave_public_group() {
        let fx = fixture(&[]);
        let group_id = new_group(&fx, true).await;
        for _ in 0..2 {
            let Json(joined) = join_group(
                Extension(member()),
                Extension(fx.store.clone()),
                ApiJson(GroupIdRequest {
                    group_id: group_id.clone(),
                }),
            )
            .await
            .unwrap();
            assert_eq!(joined.message, "Joined group");
        }
        assert!(fx.store.is_member(&group_id, "member@x.in").unwrap());
        assert_eq!(fx.store.members(&group_id).unwrap().len(), 1);

        let owner_leaves = leave_group(
            Extension(owner()),
            Extension(fx.store.clone()),
            ApiJson(LeaveGroupRequest {
                id_to_be_removed: group_id.clone(),
            }),
        )
        .await;
        assert!(matches!(owner_leaves, Err(ApiError::Conflict(_))));

        let Json(left) = leave_group(
            Extension(member()),
            Extension(fx.store.clone()),
            ApiJson(LeaveGroupRequest {
                id_to_be_removed: group_id.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(left.message, "Left group");
        assert!(!fx.store.is_member(&group_id, "member@x.in").unwrap());
    }

    #[tokio::test]
    async fn group_files_require_membership() {
        let fx = fixture(&[]);
        let group_id = new_group(&fx, false).await;
        fx.memory.insert(&format!("groups/{group_id}/notes.txt"), 4);

        let denied = get_group_file_structure(
            Extension(stranger()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            ApiJson(GroupIdRequest {
                group_id: group_id.clone(),
            }),
        )
        .await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        let Json(listing) = get_group_file_structure(
            Extension(owner()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            ApiJson(GroupIdRequest { group_id }),
        )
        .await
        .unwrap();
        assert_eq!(listing.file_structure.len(), 1);
        assert_eq!(listing.file_structure[0].key, "notes.txt");
    }

    #[tokio::test]
    async fn public_group_is_readable_but_not_writable_by_strangers() {
        let fx = fixture(&[]);
        let group_id = new_group(&fx, true).await;

        get_group_file_structure(
            Extension(stranger()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            ApiJson(GroupIdRequest {
                group_id: group_id.clone(),
            }),
        )
        .await
        .unwrap();

        let write = create_group_folder(
            Extension(stranger()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            ApiJson(GroupFolderRequest {
                group_id,
                key: String::new(),
                name: "x".into(),
            }),
        )
        .await;
        assert!(matches!(write, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn copy_preserves_folder_structure_and_skips_locked() {
        let fx = fixture(&[
            ("users/1/docs/", 0),
            ("users/1/docs/a.txt", 1),
            ("users/1/docs/sub/b.txt", 1),
            ("users/1/docs/secret.txt", 1),
        ]);
        fx.store
            .lock_file(&crate::store::LockRecord {
                object_key: "users/1/docs/secret.txt".into(),
                owner_id: "1".into(),
                salt: "s".into(),
                digest: "d".into(),
            })
            .unwrap();
        let group_id = new_group(&fx, false).await;

        let Json(response) = copy_objects_to_group(
            Extension(owner()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            ApiJson(CopyToGroupRequest {
                group_id: group_id.clone(),
                keys: vec!["docs/".into()],
                destination: "shared".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.copied, 3);
        assert_eq!(response.skipped, 1);

        let keys = fx.memory.keys();
        assert!(keys.contains(&format!("groups/{group_id}/shared/docs/a.txt")));
        assert!(keys.contains(&format!("groups/{group_id}/shared/docs/sub/b.txt")));
        assert!(!keys.contains(&format!("groups/{group_id}/shared/docs/secret.txt")));
    }

    #[tokio::test]
    async fn member_deletes_group_objects() {
        let fx = fixture(&[]);
        let group_id = new_group(&fx, false).await;
        fx.store.add_member(&group_id, "member@x.in").unwrap();
        fx.memory.insert(&format!("groups/{group_id}/a.txt"), 1);

        let Json(response) = delete_objects_in_group(
            Extension(member()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            ApiJson(GroupDeleteRequest {
                group_id,
                objects_to_delete: vec!["a.txt".into()],
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.deleted, 1);
        assert!(fx.memory.keys().is_empty());
    }

    fn key_request(group_id: &str, key: &str) -> ApiJson<GroupKeyRequest> {
        ApiJson(GroupKeyRequest {
            group_id: group_id.into(),
            key: key.into(),
        })
    }

    #[tokio::test]
    async fn public_group_downloads_are_for_members_only() {
        let fx = fixture(&[]);
        let group_id = new_group(&fx, true).await;
        fx.store.add_member(&group_id, "member@x.in").unwrap();
        fx.memory.insert(&format!("groups/{group_id}/exam.pdf"), 9);

        let denied = get_group_download_url(
            Extension(stranger()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            key_request(&group_id, "exam.pdf"),
        )
        .await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        for caller in [owner(), member()] {
            let Json(response) = get_group_download_url(
                Extension(caller),
                Extension(fx.objects.clone()),
                Extension(fx.store.clone()),
                key_request(&group_id, "exam.pdf"),
            )
            .await
            .unwrap();
            assert!(response.url.contains(&format!("groups/{group_id}/exam.pdf")));
        }

        let missing = get_group_download_url(
            Extension(member()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            key_request(&group_id, "nope.pdf"),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn group_upload_url_is_scoped_to_group_root() {
        let fx = fixture(&[]);
        let group_id = new_group(&fx, true).await;
        fx.store.add_member(&group_id, "member@x.in").unwrap();

        let upload = |caller: Claims| {
            get_group_upload_url(
                Extension(caller),
                Extension(fx.objects.clone()),
                Extension(fx.store.clone()),
                ApiJson(GroupUploadRequest {
                    group_id: group_id.clone(),
                    key: "notes/week1.pdf".into(),
                    content_type: None,
                }),
            )
        };

        let denied = upload(stranger()).await;
        assert!(matches!(denied, Err(ApiError::Forbidden(_))));

        let Json(url) = upload(member()).await.unwrap();
        assert!(url.contains(&format!("groups/{group_id}/notes/week1.pdf")));
        assert!(url.contains("type=application/pdf"));
    }

    #[tokio::test]
    async fn member_creates_group_folder() {
        let fx = fixture(&[]);
        let group_id = new_group(&fx, false).await;
        fx.store.add_member(&group_id, "member@x.in").unwrap();

        let (status, Json(created)) = create_group_folder(
            Extension(member()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            ApiJson(GroupFolderRequest {
                group_id: group_id.clone(),
                key: "notes/".into(),
                name: "week1".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.key, "notes/week1/");
        assert_eq!(
            fx.memory.keys(),
            vec![format!("groups/{group_id}/notes/week1/")]
        );

        let again = create_group_folder(
            Extension(owner()),
            Extension(fx.objects.clone()),
            Extension(fx.store.clone()),
            ApiJson(GroupFolderRequest {
                group_id,
                key: "notes".into(),
                name: "week1".into(),
            }),
        )
        .await;
        assert!(matches!(again, Err(ApiError::Conflict(_))));
    }
}
