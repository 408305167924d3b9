//! レジスタアクセス機能

use crate::{ChannelError, Result};
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

/// `syscall` 命令（0F 05）の長さ
const SYSCALL_INSN_LEN: u64 = 2;

/// レジスタアクセス
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        nix::sys::ptrace::getregs(self.pid).map_err(ChannelError::ptrace("getregs"))
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.pid, regs).map_err(ChannelError::ptrace("setregs"))
    }

    /// システムコールの戻り値レジスタを読み取る
    pub fn syscall_return(&self) -> Result<u64> {
        Ok(self.read()?.rax)
    }
}

/// システムコール入口で取得したレジスタを、復元時にそのシステムコールを
/// 再実行する形に巻き戻す
///
/// 命令ポインタを `syscall` 命令の先頭に戻し、戻り値レジスタに元の
/// システムコール番号を入れます。
pub fn rewind_to_syscall(regs: &mut user_regs_struct) {
    regs.rip = regs.rip.wrapping_sub(SYSCALL_INSN_LEN);
    regs.rax = regs.orig_rax;
}

/// システムコール番号と引数をレジスタに設定する
pub fn load_syscall(regs: &mut user_regs_struct, number: i64, args: [u64; 6]) {
    regs.orig_rax = number as u64;
    regs.rax = number as u64;
    regs.rdi = args[0];
    regs.rsi = args[1];
    regs.rdx = args[2];
    regs.r10 = args[3];
    regs.r8 = args[4];
    regs.r9 = args[5];
}

/// 入口で停止中のシステムコールを無効化する
///
/// 番号を -1 にするとカーネルは何も実行せずに -ENOSYS を返します。
pub fn cancel_syscall(regs: &mut user_regs_struct) {
    regs.orig_rax = u64::MAX;
}
