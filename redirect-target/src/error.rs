//! リモート実行チャネルのエラー型

use nix::errno::Errno;
use thiserror::Error;

/// ptraceチャネル操作の失敗
#[derive(Debug, Error)]
pub enum ChannelError {
    /// ptrace要求そのものが失敗した
    #[error("ptrace {op} failed: {errno}")]
    Ptrace { op: &'static str, errno: Errno },

    /// waitpidが失敗した
    #[error("waitpid failed: {0}")]
    Wait(Errno),

    /// トレース中にプロセスが終了した
    #[error("process exited with status {0}")]
    Exited(i32),

    /// トレース中にプロセスがシグナルで終了した
    #[error("process killed by signal {0}")]
    Killed(nix::sys::signal::Signal),

    /// 想定外の停止状態
    #[error("unexpected stop: {0}")]
    UnexpectedStop(String),

    /// レジスタが保存されていない
    #[error("registers have not been saved")]
    RegistersNotSaved,

    /// /proc/pid/mem 経由のメモリ書き込みが失敗した
    #[error("failed to write {len} bytes at 0x{addr:x}: {source}")]
    MemoryWrite {
        addr: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },
}

impl ChannelError {
    /// 失敗を表すerrno値を返す
    ///
    /// プロセスの消滅はESRCH、状態の不整合はEINVALとして扱います。
    pub fn errno(&self) -> Errno {
        match self {
            ChannelError::Ptrace { errno, .. } => *errno,
            ChannelError::Wait(errno) => *errno,
            ChannelError::Exited(_) | ChannelError::Killed(_) => Errno::ESRCH,
            ChannelError::UnexpectedStop(_) | ChannelError::RegistersNotSaved => Errno::EINVAL,
            ChannelError::MemoryWrite { source, .. } => source
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }

    pub(crate) fn ptrace(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| ChannelError::Ptrace { op, errno }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let err = ChannelError::Ptrace { op: "attach", errno: Errno::EPERM };
        assert_eq!(err.errno(), Errno::EPERM);
        assert_eq!(ChannelError::Exited(0).errno(), Errno::ESRCH);
        assert_eq!(ChannelError::RegistersNotSaved.errno(), Errno::EINVAL);

        let io = std::io::Error::from_raw_os_error(Errno::EFAULT as i32);
        let err = ChannelError::MemoryWrite { addr: 0x1000, len: 8, source: io };
        assert_eq!(err.errno(), Errno::EFAULT);
    }
}
