//! 登录、Bearer 令牌校验与登录限流。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Request, header};
use axum::{middleware, response::Response};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::JsonOrForm;
use crate::error::ApiError;
use crate::http::resolve_client_ip;
use crate::identity::IdentityVerifier;
use crate::limiter::AttemptLimiter;
use crate::store::{MetadataStore, User, normalize_email};
use crate::token::{Claims, TokenSigner};

pub struct AuthConfig {
    pub signer: TokenSigner,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub allowed_domain: String,
    pub token_ttl: Duration,
    /// 是否信任 `X-Forwarded-For`（仅在反向代理之后开启）。
    pub trust_forwarded: bool,
    /// 按客户端 IP 统计的登录失败。
    pub login_limiter: AttemptLimiter<IpAddr>,
    /// 按（客户端 IP, 对象键）统计的文件密码校验失败。
    pub password_limiter: AttemptLimiter<(IpAddr, String)>,
}

impl AuthConfig {
    /// 计算限流与日志使用的客户端 IP。
    pub fn client_ip(&self, headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
        resolve_client_ip(headers, Some(addr.ip()), self.trust_forwarded).unwrap_or_else(|| addr.ip())
    }
}

/// 认证中间件：校验 Bearer 令牌并把 [`Claims`] 挂到请求上。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) || req.method() == axum::http::Method::OPTIONS {
        return Ok(next.run(req).await);
    }

    let claims = authenticate(&auth, req.headers())?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

fn authenticate(auth: &AuthConfig, headers: &HeaderMap) -> Result<Claims, ApiError> {
    if !headers.contains_key(header::AUTHORIZATION) {
        return Err(ApiError::Unauthorized("Token not given".into()));
    }
    let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() else {
        return Err(ApiError::Unauthorized("Invalid token".into()));
    };
    Ok(auth.signer.verify(bearer.token())?)
}

fn is_auth_exempt_path(path: &str) -> bool {
    matches!(path, "/" | "/login" | "/validatePassword" | "/api/version")
}

#[derive(Deserialize)]
pub(crate) struct LoginRequest {
    token: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct LoginResponse {
    token: String,
}

/// 登录接口：校验 Google ID token，签发 Bearer 令牌。
pub async fn login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(store): Extension<Arc<MetadataStore>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    JsonOrForm(payload): JsonOrForm<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Some(id_token) = payload.token.filter(|t| !t.trim().is_empty()) else {
        return Err(ApiError::BadRequest("Token missing".into()));
    };

    let client_ip = auth.client_ip(&headers, addr);
    if let Some(retry_after) = auth.login_limiter.check(client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    let identity = match auth.verifier.verify(&id_token).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!(client_ip = %client_ip, error = %err, "id token rejected");
            register_login_failure(&auth, client_ip).await;
            return Err(err.into());
        }
    };

    let email = normalize_email(&identity.email);
    if !email_in_domain(&email, &auth.allowed_domain) {
        warn!(client_ip = %client_ip, email, "login from foreign domain");
        register_login_failure(&auth, client_ip).await;
        return Err(ApiError::Forbidden("Unauthorized login".into()));
    }

    auth.login_limiter.clear(&client_ip).await;
    let first_login = store.get_user(&identity.sub)?.is_none();
    store.upsert_user(&User {
        id: identity.sub.clone(),
        email: email.clone(),
        name: identity.name.clone(),
        picture: identity.picture.clone(),
    })?;

    let token = auth.signer.issue(
        Claims {
            id: identity.sub,
            email,
            name: identity.name,
            picture: identity.picture,
            exp: 0,
        },
        auth.token_ttl,
    );
    info!(client_ip = %client_ip, first_login, "login succeeded");
    Ok(Json(LoginResponse { token }))
}

/// 返回当前令牌中的用户信息。
pub async fn me(Extension(claims): Extension<Claims>) -> Json<Claims> {
    Json(claims)
}

fn email_in_domain(email: &str, domain: &str) -> bool {
    let domain = domain.trim().trim_start_matches('@').to_ascii_lowercase();
    match email.rsplit_once('@') {
        Some((local, host)) => !local.is_empty() && host == domain,
        None => false,
    }
}

async fn register_login_failure(auth: &AuthConfig, ip: IpAddr) {
    if auth.login_limiter.register_failure(ip).await {
        warn!(client_ip = %ip, "login locked out");
    }
}

/// 清理过期的限流记录。
pub async fn prune_login_attempts(auth: &AuthConfig) {
    auth.login_limiter.prune().await;
    auth.password_limiter.prune().await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::identity::{GoogleIdentity, IdentityError};

    /// Accepts `good|<sub>|<email>` tokens without network access.
    pub(crate) struct StaticVerifier;

    #[async_trait]
    impl IdentityVerifier for StaticVerifier {
        async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, IdentityError> {
            let mut parts = id_token.splitn(3, '|');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("good"), Some(sub), Some(email)) => Ok(GoogleIdentity {
                    sub: sub.to_string(),
                    email: email.to_string(),
                    name: "Test User".into(),
                    picture: String::new(),
                }),
                _ => Err(IdentityError::Rejected("unknown token".into())),
            }
        }
    }

    pub(crate) fn make_auth(max_attempts: u32) -> Arc<AuthConfig> {
        Arc::new(AuthConfig {
            signer: TokenSigner::new("test-secret"),
            verifier: Arc::new(StaticVerifier),
            allowed_domain: "hyderabad.bits-pilani.ac.in".into(),
            token_ttl: Duration::from_secs(3600),
            trust_forwarded: false,
            login_limiter: AttemptLimiter::new(
                Duration::from_secs(300),
                max_attempts,
                Duration::from_secs(600),
            ),
            password_limiter: AttemptLimiter::new(
                Duration::from_secs(300),
                max_attempts,
                Duration::from_secs(600),
            ),
        })
    }

    fn addr() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000)))
    }

    async fn attempt(
        auth: &Arc<AuthConfig>,
        store: &Arc<MetadataStore>,
        token: Option<&str>,
    ) -> Result<Json<LoginResponse>, ApiError> {
        attempt_with_headers(auth, store, token, HeaderMap::new()).await
    }

    async fn attempt_with_headers(
        auth: &Arc<AuthConfig>,
        store: &Arc<MetadataStore>,
        token: Option<&str>,
        headers: HeaderMap,
    ) -> Result<Json<LoginResponse>, ApiError> {
        login(
            Extension(auth.clone()),
            Extension(store.clone()),
            addr(),
            headers,
            JsonOrForm(LoginRequest {
                token: token.map(str::to_string),
            }),
        )
        .await
    }

    fn forwarded_for(ip: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", ip.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn login_issues_token_and_records_user() {
        let auth = make_auth(5);
        let store = Arc::new(MetadataStore::in_memory().unwrap());
        let Json(response) = attempt(
            &auth,
            &store,
            Some("good|1093|F2021@Hyderabad.bits-pilani.ac.in"),
        )
        .await
        .unwrap();

        let claims = auth.signer.verify(&response.token).unwrap();
        assert_eq!(claims.id, "1093");
        assert_eq!(claims.email, "f2021@hyderabad.bits-pilani.ac.in");
        assert!(store.get_user("1093").unwrap().is_some());
    }

    #[tokio::test]
    async fn login_status_codes() {
        let auth = make_auth(0);
        let store = Arc::new(MetadataStore::in_memory().unwrap());

        let missing = attempt(&auth, &store, None).await;
        assert!(matches!(missing, Err(ApiError::BadRequest(_))));

        let invalid = attempt(&auth, &store, Some("forged")).await;
        assert!(matches!(invalid, Err(ApiError::Unauthorized(_))));

        let foreign = attempt(&auth, &store, Some("good|1|someone@gmail.com")).await;
        assert!(matches!(foreign, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn repeated_failures_lock_out_client() {
        let auth = make_auth(2);
        let store = Arc::new(MetadataStore::in_memory().unwrap());
        for _ in 0..2 {
            let result = attempt(&auth, &store, Some("forged")).await;
            assert!(matches!(result, Err(ApiError::Unauthorized(_))));
        }
        let locked = attempt(
            &auth,
            &store,
            Some("good|1093|f2021@hyderabad.bits-pilani.ac.in"),
        )
        .await;
        assert!(matches!(locked, Err(ApiError::TooManyRequests(_))));
    }

    #[tokio::test]
    async fn rotating_forwarded_header_does_not_reset_lockout() {
        let auth = make_auth(2);
        let store = Arc::new(MetadataStore::in_memory().unwrap());
        for ip in ["203.0.113.1", "203.0.113.2"] {
            let result = attempt_with_headers(&auth, &store, Some("forged"), forwarded_for(ip)).await;
            assert!(matches!(result, Err(ApiError::Unauthorized(_))));
        }
        let locked = attempt_with_headers(
            &auth,
            &store,
            Some("good|1093|f2021@hyderabad.bits-pilani.ac.in"),
            forwarded_for("203.0.113.3"),
        )
        .await;
        assert!(matches!(locked, Err(ApiError::TooManyRequests(_))));
    }

    #[test]
    fn forwarded_header_is_used_only_when_trusted() {
        let peer = SocketAddr::from(([10, 0, 0, 1], 4000));
        let headers = forwarded_for("203.0.113.7, 10.0.0.1");

        let untrusted = make_auth(0);
        assert_eq!(untrusted.client_ip(&headers, peer), peer.ip());

        let mut trusted = Arc::into_inner(make_auth(0)).unwrap();
        trusted.trust_forwarded = true;
        assert_eq!(
            trusted.client_ip(&headers, peer),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn authenticate_distinguishes_missing_and_invalid() {
        let auth = make_auth(0);
        let mut headers = HeaderMap::new();
        assert!(matches!(
            authenticate(&auth, &headers),
            Err(ApiError::Unauthorized(msg)) if msg == "Token not given"
        ));

        headers.insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert!(matches!(
            authenticate(&auth, &headers),
            Err(ApiError::Unauthorized(msg)) if msg == "Invalid token"
        ));

        let token = auth.signer.issue(
            Claims {
                id: "1".into(),
                email: "a@hyderabad.bits-pilani.ac.in".into(),
                name: String::new(),
                picture: String::new(),
                exp: 0,
            },
            Duration::from_secs(60),
        );
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        assert_eq!(authenticate(&auth, &headers).unwrap().id, "1");
    }

    #[test]
    fn domain_check_requires_exact_host() {
        assert!(email_in_domain("a@hyderabad.bits-pilani.ac.in", "hyderabad.bits-pilani.ac.in"));
        assert!(!email_in_domain("a@evilhyderabad.bits-pilani.ac.in", "hyderabad.bits-pilani.ac.in"));
        assert!(!email_in_domain("@hyderabad.bits-pilani.ac.in", "hyderabad.bits-pilani.ac.in"));
    }
}
