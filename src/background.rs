//! 后台任务：定期清理登录限流记录。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::{AuthConfig, prune_login_attempts};
use crate::config::LOGIN_PRUNE_INTERVAL_SECS;

/// 启动后台清理任务。
pub fn spawn_background_tasks(auth: Arc<AuthConfig>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(LOGIN_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            prune_login_attempts(&auth).await;
            debug!("pruned login attempts");
        }
    });
}
