//! アタッチ中に確保した資源の後始末
//!
//! 資源を確保するたびに取り消し操作を積み、スコープを抜けるときに
//! 逆順で実行します。成功時も失敗時も同じ順序で解放されます。

use crate::errors::CleanupError;
use crate::redirect::RedirectStage;
use redirect_target::{RemoteTarget, SyscallName, SyscallReturn};
use tracing::{debug, warn};

/// 対象プロセス内に確保したスクラッチ領域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegion {
    /// 対象プロセス内の先頭アドレス
    pub addr: u64,
    pub len: usize,
}

/// 取り消し操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Undo {
    /// 保存したレジスタを復元する
    RestoreRegisters,
    /// スクラッチ領域を解放する
    Unmap(ScratchRegion),
    /// 対象プロセス内で開いたファイルディスクリプタを閉じる
    Close(u64),
}

impl Undo {
    fn step(&self) -> &'static str {
        match self {
            Undo::RestoreRegisters => "restore registers",
            Undo::Unmap(_) => "munmap scratch page",
            Undo::Close(_) => "close log fd",
        }
    }
}

/// 取り消し操作のスタックを持つスコープガード
///
/// デタッチはこのガードの外側で、ガードが破棄された後に行います。
pub struct Session<'a, T: RemoteTarget> {
    target: &'a mut T,
    undo: Vec<Undo>,
}

impl<'a, T: RemoteTarget> Session<'a, T> {
    pub fn new(target: &'a mut T) -> Self {
        Self {
            target,
            undo: Vec::new(),
        }
    }

    /// 対象プロセスへの参照を取得する
    pub fn target(&mut self) -> &mut T {
        &mut *self.target
    }

    /// 取り消し操作を積む
    pub fn defer(&mut self, undo: Undo) {
        self.undo.push(undo);
    }

    fn run(&mut self, undo: Undo) -> Result<(), CleanupError> {
        let step = undo.step();
        match undo {
            Undo::RestoreRegisters => self
                .target
                .restore_registers()
                .map_err(|source| CleanupError::Channel { step, source }),
            Undo::Unmap(region) => {
                self.remote(step, SyscallName::Munmap, [region.addr, region.len as u64, 0, 0, 0, 0])
            }
            Undo::Close(fd) => self.remote(step, SyscallName::Close, [fd, 0, 0, 0, 0, 0]),
        }
    }

    fn remote(
        &mut self,
        step: &'static str,
        name: SyscallName,
        args: [u64; 6],
    ) -> Result<(), CleanupError> {
        let number = self
            .target
            .syscall_number(name)
            .ok_or(CleanupError::Unavailable { step, name })?;
        match self.target.remote_syscall(number, args) {
            Ok(SyscallReturn::Value(_)) => Ok(()),
            Ok(SyscallReturn::Errno(errno)) => Err(CleanupError::Remote { step, errno }),
            Err(source) => Err(CleanupError::Channel { step, source }),
        }
    }
}

impl<T: RemoteTarget> Drop for Session<'_, T> {
    fn drop(&mut self) {
        debug!(
            pid = self.target.pid().as_raw(),
            stage = %RedirectStage::Cleanup,
            pending = self.undo.len()
        );

        // 各操作は前の操作の成否に関係なく実行する
        while let Some(undo) = self.undo.pop() {
            match self.run(undo) {
                Ok(()) => debug!(step = undo.step(), "cleanup done"),
                Err(e) => warn!(error = ?e, "{}", e),
            }
        }
    }
}
