//! エラー型

use nix::errno::Errno;
use redirect_target::{ChannelError, SyscallName};
use std::path::PathBuf;
use thiserror::Error;

/// 構造的な失敗（errnoを伴わない失敗）の終了コード
pub const EXIT_STRUCTURAL: i32 = 1;

/// /proc/pid/stat の読み取りエラー
#[derive(Debug, Error)]
pub enum StatusError {
    /// レコードを読み取れない
    #[error("unable to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// レコードの書式が不正
    #[error("malformed status record ({fields} of 7 fields parsed): {record:?}")]
    Parse { fields: usize, record: String },
}

/// リダイレクト処理のエラー
///
/// 最初に発生したエラーだけが呼び出し元に返されます。
/// 後始末の失敗は [`CleanupError`] としてログに出力されるだけです。
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("failed to read process status")]
    StatusRead(#[source] StatusError),

    #[error("failed to parse process status")]
    StatusParse(#[source] StatusError),

    #[error("unable to attach to process {pid}")]
    Attach {
        pid: i32,
        #[source]
        source: ChannelError,
    },

    #[error("unable to reach a syscall boundary")]
    Boundary(#[source] ChannelError),

    #[error("unable to save registers")]
    SaveRegisters(#[source] ChannelError),

    #[error("unable to allocate a scratch page in the process: {0}")]
    Alloc(Errno),

    #[error("unable to copy the log file path to the process: {0}")]
    Copy(Errno),

    #[error("unable to open the log file in the process: {0}")]
    RemoteOpen(Errno),

    #[error("unable to dup2 fd {target} in the process: {errno}")]
    Dup { target: i32, errno: Errno },

    #[error("dup2 onto fd {target} returned {actual}")]
    DupMismatch { target: i32, actual: u64 },
}

impl From<StatusError> for RedirectError {
    fn from(e: StatusError) -> Self {
        match e {
            StatusError::Read { .. } => RedirectError::StatusRead(e),
            StatusError::Parse { .. } => RedirectError::StatusParse(e),
        }
    }
}

impl RedirectError {
    /// プロセスの終了コード
    ///
    /// errnoを伴うエラーはその値を、そうでないものは1を返します。
    pub fn exit_code(&self) -> i32 {
        match self.errno() {
            Some(errno) => errno as i32,
            None => EXIT_STRUCTURAL,
        }
    }

    /// エラーの原因となったerrno
    pub fn errno(&self) -> Option<Errno> {
        match self {
            RedirectError::StatusRead(StatusError::Read { source, .. }) => {
                Some(source.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO))
            }
            RedirectError::StatusRead(StatusError::Parse { .. })
            | RedirectError::StatusParse(_) => Some(Errno::EINVAL),
            RedirectError::Attach { source, .. } => Some(source.errno()),
            RedirectError::Boundary(source) | RedirectError::SaveRegisters(source) => {
                Some(source.errno())
            }
            RedirectError::Alloc(errno)
            | RedirectError::Copy(errno)
            | RedirectError::RemoteOpen(errno)
            | RedirectError::Dup { errno, .. } => Some(*errno),
            RedirectError::DupMismatch { .. } => None,
        }
    }
}

/// 後始末の失敗（ログ出力のみ）
#[derive(Debug, Error)]
pub enum CleanupError {
    /// チャネル操作そのものが失敗した
    #[error("cleanup step '{step}' failed")]
    Channel {
        step: &'static str,
        #[source]
        source: ChannelError,
    },

    /// リモートシステムコールがエラーを返した
    #[error("cleanup step '{step}' failed in the process: {errno}")]
    Remote { step: &'static str, errno: Errno },

    /// システムコールがこのアーキテクチャに存在しない
    #[error("cleanup step '{step}' skipped: syscall {name} unavailable")]
    Unavailable { step: &'static str, name: SyscallName },
}
