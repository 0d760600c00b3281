//! CLI 参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const USER_ROOT_PREFIX: &str = "users";
pub const GROUP_ROOT_PREFIX: &str = "groups";
pub const DEFAULT_ALLOWED_EMAIL_DOMAIN: &str = "hyderabad.bits-pilani.ac.in";
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_PRESIGN_TTL_SECS: u64 = 15 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const LOGIN_PRUNE_INTERVAL_SECS: u64 = 300;
pub const MIN_SEARCH_TERM_CHARS: usize = 2;

/// 服务端 CLI 参数与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "cruxdrive", version = VERSION_INFO, about = "CRUxDrive API server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "CRUX_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PORT",
        default_value_t = 8000,
        help = "Listen port"
    )]
    pub port: u16,
    #[arg(short = 'c', long, env = "CRUX_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "CRUX_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "CRUX_TRUST_FORWARDED",
        default_value_t = false,
        help = "Trust X-Forwarded-For (only behind a reverse proxy)"
    )]
    pub trust_forwarded: bool,
    #[arg(long, env = "CRUX_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "JWT_SECRET",
        value_parser = parse_secret,
        help = "Secret used to sign bearer tokens"
    )]
    pub jwt_secret: String,
    #[arg(
        long,
        env = "CRUX_TOKEN_TTL_SECS",
        default_value_t = DEFAULT_TOKEN_TTL_SECS,
        help = "Bearer token lifetime in seconds"
    )]
    pub token_ttl_secs: u64,
    #[arg(long, env = "GOOGLE_CLIENT_ID", help = "Google OAuth client id")]
    pub google_client_id: String,
    #[arg(
        long,
        env = "CRUX_ALLOWED_EMAIL_DOMAIN",
        default_value = DEFAULT_ALLOWED_EMAIL_DOMAIN,
        help = "Only accounts of this email domain may log in"
    )]
    pub allowed_email_domain: String,
    #[arg(long, env = "CRUX_BUCKET", help = "Object storage bucket")]
    pub bucket: String,
    #[arg(
        long,
        env = "AWS_REGION",
        default_value = "us-east-1",
        help = "Object storage region"
    )]
    pub region: String,
    #[arg(
        long,
        env = "CRUX_S3_ENDPOINT",
        help = "Custom S3-compatible endpoint (path-style addressing)"
    )]
    pub s3_endpoint: Option<String>,
    #[arg(
        long,
        env = "CRUX_PRESIGN_TTL_SECS",
        default_value_t = DEFAULT_PRESIGN_TTL_SECS,
        help = "Pre-signed URL lifetime in seconds"
    )]
    pub presign_ttl_secs: u64,
    #[arg(
        short = 'd',
        long,
        env = "CRUX_DATABASE",
        default_value = ".cruxdrive/metadata.db",
        help = "Metadata database path"
    )]
    pub database: String,
    #[arg(
        long,
        env = "CRUX_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max failed logins before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "CRUX_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "CRUX_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
}

fn parse_secret(value: &str) -> Result<String, String> {
    if value.trim().is_empty() {
        return Err("secret must not be empty".into());
    }
    Ok(value.to_string())
}
