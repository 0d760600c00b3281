//! 路由表与全局中间件。

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{self, AuthConfig};
use crate::http::{self, resolve_client_ip};
use crate::objects::SharedObjectStore;
use crate::store::MetadataStore;
use crate::{files, groups, locks, shares, version};

/// 构建完整的 API 路由与全局中间件。
pub fn build_router(
    store: Arc<MetadataStore>,
    objects: SharedObjectStore,
    auth_config: Arc<AuthConfig>,
    cors_origins: Option<&str>,
) -> Router {
    let trust_forwarded = auth_config.trust_forwarded;
    Router::new()
        .route("/", get(version::welcome))
        .route("/api/version", get(version::get_version_info))
        .route("/login", post(auth::login))
        .route("/me", get(auth::me))
        .route("/getFileStructure", get(files::get_file_structure))
        .route("/getFileTree", get(files::get_file_tree))
        .route("/getUploadURL", post(files::get_upload_url))
        .route("/getDownloadURL", post(files::get_download_url))
        .route("/deleteObjects", post(files::delete_objects))
        .route("/createFolder", post(files::create_folder))
        .route("/lockFile", post(locks::lock_file))
        .route("/unlockFile", post(locks::unlock_file))
        .route("/getLockedFiles", get(locks::get_locked_files))
        .route("/validatePassword", post(locks::validate_password))
        .route("/createNewGroup", post(groups::create_group))
        .route("/getAllMyGroups", get(groups::get_my_groups))
        .route("/getAllGroupsYouArePartOf", get(groups::get_joined_groups))
        .route("/getAllPublicGroups", get(groups::get_public_groups))
        .route("/joinGroup", post(groups::join_group))
        .route("/leaveGroup", post(groups::leave_group))
        .route("/addEmailToGroup", post(groups::add_email_to_group))
        .route("/getGroupMembers", post(groups::get_group_members))
        .route("/getGroupFileStructure", post(groups::get_group_file_structure))
        .route("/createGroupFolder", post(groups::create_group_folder))
        .route("/deleteObjectsInGroup", post(groups::delete_objects_in_group))
        .route("/getGroupUploadURL", post(groups::get_group_upload_url))
        .route("/getGroupDownloadURL", post(groups::get_group_download_url))
        .route("/copyObjectsToGroup", post(groups::copy_objects_to_group))
        .route("/shareObjects", post(shares::share_objects))
        .route("/unshareObjects", post(shares::unshare_objects))
        .route("/getSharedFilesFolders", get(shares::get_shared_files_folders))
        .route("/getSharedDownloadURL", post(shares::get_shared_download_url))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip, trust_forwarded)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(store))
        .layer(Extension(objects))
        .layer(Extension(auth_config))
        .layer(http::build_cors_layer(cors_origins))
}
