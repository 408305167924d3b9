//! redirect のコア機能
//!
//! 実行中のプロセスにアタッチし、標準出力と標準エラー出力を
//! 指定したファイルへ付け替えます。プロセス状態の読み取り、停止の同期、
//! リモートシステムコールの手順と後始末を提供します。

pub mod config;
pub mod errors;
pub mod redirect;
pub mod session;
pub mod stat;
pub mod stop;

pub use config::RedirectConfig;
pub use errors::{CleanupError, RedirectError, StatusError};
pub use redirect::{RedirectRequest, RedirectStage, Redirector};
pub use session::{ScratchRegion, Session, Undo};
pub use stat::{ProcessSnapshot, StatusReader, StatusSource};
pub use stop::{JobControl, KillSignals, StopOutcome, StopSynchronizer};

// 他のクレートから使用するために再エクスポート
pub use redirect_target::{ChannelError, Ptrace, RemoteChannel, RemoteTarget, SyscallName, SyscallReturn};

/// 実行中のプロセスの出力をptraceで付け替える
pub fn redirect_process(request: &RedirectRequest, config: RedirectConfig) -> Result<(), RedirectError> {
    Redirector::new(Ptrace, KillSignals)
        .with_config(config)
        .redirect(request)
}
