//! TLS 证书加载。

use axum_server::tls_rustls::RustlsConfig;
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 同时配置了证书与私钥时返回 Rustls 配置，否则使用明文 HTTP。
pub async fn load_rustls_config(args: &Args) -> Result<Option<RustlsConfig>, std::io::Error> {
    let (cert_path, key_path) = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => return Ok(None),
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "both --tls-cert and --tls-key are required for TLS",
            ));
        }
    };

    let cert = fs::read(cert_path).await?;
    let key = fs::read(key_path).await?;
    info!(cert = %cert_path, "loaded TLS certificate");
    RustlsConfig::from_pem(cert, key).await.map(Some)
}
