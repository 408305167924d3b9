//! リモート実行チャネルのインターフェース
//!
//! オーケストレータはこのトレイト越しにトレース対象を操作します。
//! 本番実装は [`crate::Ptrace`] / [`crate::Tracee`] です。

use crate::{Result, SyscallName, SyscallReturn};
use nix::errno::Errno;
use nix::unistd::Pid;

/// トレース対象へのアタッチを行うチャネル
pub trait RemoteChannel {
    /// アタッチ済みのトレース対象
    type Target: RemoteTarget;

    /// 指定されたプロセスにアタッチする
    fn attach(&mut self, pid: Pid) -> Result<Self::Target>;
}

/// アタッチ済みのトレース対象
///
/// `detach` はハンドルを消費するため、1回のアタッチにつき1回しか呼べません。
pub trait RemoteTarget {
    /// プロセスIDを取得する
    fn pid(&self) -> Pid;

    /// システムコール入口まで実行を進める
    fn advance_to_syscall(&mut self) -> Result<()>;

    /// 現在のレジスタを保存する
    fn save_registers(&mut self) -> Result<()>;

    /// 保存したレジスタを復元する
    fn restore_registers(&mut self) -> Result<()>;

    /// トレース対象のメモリに書き込む
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// トレース対象の中でシステムコールを実行する
    fn remote_syscall(&mut self, number: i64, args: [u64; 6]) -> Result<SyscallReturn>;

    /// システムコール番号を解決する
    fn syscall_number(&self, name: SyscallName) -> Option<i64>;

    /// 最後に観測したエラー
    fn last_error(&self) -> Option<Errno>;

    /// デタッチする
    fn detach(self) -> Result<()>;
}
