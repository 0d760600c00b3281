//! 失败次数限流：窗口内失败达到上限后锁定一段时间。

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct FailedAttempts {
    pub window_start: Instant,
    pub failures: u32,
    pub locked_until: Option<Instant>,
}

impl FailedAttempts {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            failures: 0,
            locked_until: None,
        }
    }
}

/// 按键（IP、IP + 对象键等）统计失败次数；`max_attempts == 0` 时不限流。
pub struct AttemptLimiter<K> {
    attempts: Mutex<HashMap<K, FailedAttempts>>,
    window: Duration,
    max_attempts: u32,
    lockout: Duration,
}

impl<K: Eq + Hash> AttemptLimiter<K> {
    pub fn new(window: Duration, max_attempts: u32, lockout: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            window,
            max_attempts,
            lockout,
        }
    }

    /// 被锁定时返回剩余秒数（用于 `Retry-After`）。
    pub async fn check(&self, key: K) -> Option<u64> {
        if self.max_attempts == 0 {
            return None;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(key).or_insert_with(|| FailedAttempts::new(now));

        if let Some(locked_until) = entry.locked_until {
            if now < locked_until {
                return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
            }
            *entry = FailedAttempts::new(now);
        }

        if now.duration_since(entry.window_start) > self.window {
            entry.window_start = now;
            entry.failures = 0;
        }

        None
    }

    /// 记录一次失败；返回本次是否触发锁定。
    pub async fn register_failure(&self, key: K) -> bool {
        if self.max_attempts == 0 {
            return false;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(key).or_insert_with(|| FailedAttempts::new(now));

        if now.duration_since(entry.window_start) > self.window {
            *entry = FailedAttempts::new(now);
        }

        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= self.max_attempts {
            entry.locked_until = Some(now + self.lockout);
            return true;
        }
        false
    }

    pub async fn clear(&self, key: &K) {
        self.attempts.lock().await.remove(key);
    }

    /// 清理过期记录。
    pub async fn prune(&self) {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        attempts.retain(|_, entry| {
            if let Some(locked_until) = entry.locked_until {
                return locked_until > now;
            }
            now.duration_since(entry.window_start) <= self.window
        });
    }

    #[cfg(test)]
    pub async fn tracked(&self) -> usize {
        self.attempts.lock().await.len()
    }
}
