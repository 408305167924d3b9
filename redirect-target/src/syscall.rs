//! リモートシステムコールの番号解決と戻り値の解釈

use nix::errno::Errno;
use nix::libc;
use std::fmt;

/// カーネルがエラーとして返す値の上限（linux/err.h の MAX_ERRNO）
const MAX_ERRNO: u64 = 4095;

/// 注入に使用するシステムコール
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallName {
    Mmap2,
    Mmap,
    Munmap,
    Open,
    Close,
    Dup2,
}

impl SyscallName {
    /// システムコール名（ログ出力用）
    pub fn as_str(&self) -> &'static str {
        match self {
            SyscallName::Mmap2 => "mmap2",
            SyscallName::Mmap => "mmap",
            SyscallName::Munmap => "munmap",
            SyscallName::Open => "open",
            SyscallName::Close => "close",
            SyscallName::Dup2 => "dup2",
        }
    }

    /// 実行中のアーキテクチャでのシステムコール番号を取得する
    ///
    /// アーキテクチャに存在しないシステムコールの場合は `None` を返します。
    pub fn number(&self) -> Option<i64> {
        arch::number(*self)
    }
}

impl fmt::Display for SyscallName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// リモートシステムコールの結果
///
/// 戻り値レジスタの生の値は成功値とエラーの区別がつかないため、
/// チャネル側でタグ付けしてから呼び出し側に渡します。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallReturn {
    /// 成功（アドレスやファイルディスクリプタなど）
    Value(u64),
    /// 失敗（カーネルが返したerrno）
    Errno(Errno),
}

impl SyscallReturn {
    /// 戻り値レジスタの値を解釈する
    ///
    /// `[-4095, -1]` の範囲はカーネルが返す負のerrnoとして扱います。
    /// カーネル自身がこの範囲をユーザー空間アドレスとして返すことはありません。
    pub fn decode(raw: u64) -> Self {
        if raw > u64::MAX - MAX_ERRNO {
            SyscallReturn::Errno(Errno::from_raw(raw.wrapping_neg() as i32))
        } else {
            SyscallReturn::Value(raw)
        }
    }

    /// `Result` に変換する
    pub fn into_result(self) -> Result<u64, Errno> {
        match self {
            SyscallReturn::Value(value) => Ok(value),
            SyscallReturn::Errno(errno) => Err(errno),
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::*;

    pub(super) fn number(name: SyscallName) -> Option<i64> {
        match name {
            SyscallName::Mmap2 => None,
            SyscallName::Mmap => Some(libc::SYS_mmap),
            SyscallName::Munmap => Some(libc::SYS_munmap),
            SyscallName::Open => Some(libc::SYS_open),
            SyscallName::Close => Some(libc::SYS_close),
            SyscallName::Dup2 => Some(libc::SYS_dup2),
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
compile_error!("redirect-target currently supports x86_64 Linux only");
