//! リダイレクト処理の設定

use nix::libc;
use std::time::Duration;

/// 停止待ちのタイムアウト
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// 停止待ちのポーリング間隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 作成するログファイルのパーミッション
pub const DEFAULT_CREATE_MODE: u32 = 0o777;

/// リダイレクト処理の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectConfig {
    /// 停止状態になるまで待つ最大時間
    pub stop_timeout: Duration,
    /// 状態を確認する間隔
    pub poll_interval: Duration,
    /// 対象プロセス内に確保するスクラッチ領域のサイズ
    pub page_size: usize,
    /// リモート open に渡すフラグ
    pub open_flags: i32,
    /// リモート open に渡すモード
    pub create_mode: u32,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            page_size: redirect_target::page_size(),
            open_flags: libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT,
            create_mode: DEFAULT_CREATE_MODE,
        }
    }
}

impl RedirectConfig {
    /// 停止待ちのタイムアウトを変更する
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// ポーリング間隔を変更する
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// スクラッチ領域のサイズを変更する
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedirectConfig::default();
        assert_eq!(config.stop_timeout, Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.page_size, redirect_target::page_size());
        assert_eq!(config.open_flags & libc::O_ACCMODE, libc::O_WRONLY);
        assert_ne!(config.open_flags & libc::O_APPEND, 0);
        assert_ne!(config.open_flags & libc::O_CREAT, 0);
        assert_eq!(config.create_mode, 0o777);
    }

    #[test]
    fn test_builders() {
        let config = RedirectConfig::default()
            .with_stop_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(1))
            .with_page_size(4096);
        assert_eq!(config.stop_timeout, Duration::from_millis(50));
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.page_size, 4096);
    }
}
