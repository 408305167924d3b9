//! 実行中プロセスの標準出力・標準エラー出力の付け替え
//!
//! 対象を停止してアタッチし、対象の中で open と dup2 を実行させてから
//! すべての資源を解放して再開させます。どの段階で失敗しても、
//! 対象には最後に必ず1回だけ SIGCONT が送られます。

use crate::config::RedirectConfig;
use crate::errors::{CleanupError, RedirectError};
use crate::session::{ScratchRegion, Session, Undo};
use crate::stat::{StatusReader, StatusSource};
use crate::stop::{JobControl, StopSynchronizer};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use redirect_target::{ChannelError, RemoteChannel, RemoteTarget, SyscallName, SyscallReturn};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// 付け替え先のファイルディスクリプタ（標準出力、標準エラー出力）
const REDIRECTED_FDS: [i32; 2] = [1, 2];

/// リダイレクト要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRequest {
    pub pid: Pid,
    /// 出力先のファイル
    pub path: PathBuf,
}

impl RedirectRequest {
    pub fn new(pid: i32, path: impl Into<PathBuf>) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            path: path.into(),
        }
    }
}

/// 処理の段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectStage {
    Start,
    Stopped,
    Attached,
    AtSyscallBoundary,
    RegistersSaved,
    ScratchAllocated,
    PathWritten,
    RemoteFileOpened,
    Fd1Redirected,
    Fd2Redirected,
    Success,
    Cleanup,
}

impl RedirectStage {
    /// 指定した fd の付け替え完了段階
    fn redirected(fd: i32) -> Self {
        if fd == 1 {
            RedirectStage::Fd1Redirected
        } else {
            RedirectStage::Fd2Redirected
        }
    }
}

impl fmt::Display for RedirectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RedirectStage::Start => "start",
            RedirectStage::Stopped => "stopped",
            RedirectStage::Attached => "attached",
            RedirectStage::AtSyscallBoundary => "at-syscall-boundary",
            RedirectStage::RegistersSaved => "registers-saved",
            RedirectStage::ScratchAllocated => "scratch-allocated",
            RedirectStage::PathWritten => "path-written",
            RedirectStage::RemoteFileOpened => "remote-file-opened",
            RedirectStage::Fd1Redirected => "fd1-redirected",
            RedirectStage::Fd2Redirected => "fd2-redirected",
            RedirectStage::Success => "success",
            RedirectStage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// リダイレクト処理
///
/// 同じプロセスに対する並行実行はサポートしません。呼び出し側で
/// 1プロセスにつき1つずつ実行してください。
pub struct Redirector<C, J> {
    channel: C,
    jobs: J,
    config: RedirectConfig,
}

impl<C: RemoteChannel, J: JobControl> Redirector<C, J> {
    /// 新しいリダイレクト処理を作成する
    pub fn new(channel: C, jobs: J) -> Self {
        Self {
            channel,
            jobs,
            config: RedirectConfig::default(),
        }
    }

    /// 設定を変更する
    pub fn with_config(mut self, config: RedirectConfig) -> Self {
        self.config = config;
        self
    }

    /// 対象プロセスの出力を付け替える
    ///
    /// /proc/pid/stat を開けない場合はシグナルを送らずに失敗します。
    pub fn redirect(&mut self, request: &RedirectRequest) -> Result<(), RedirectError> {
        let mut status = StatusReader::open(request.pid.as_raw()).map_err(|e| {
            error!(error = %e, "unable to open process status");
            RedirectError::from(e)
        })?;
        self.redirect_with_status(request, &mut status)
    }

    /// 状態の取得元を指定して出力を付け替える
    pub fn redirect_with_status<S: StatusSource>(
        &mut self,
        request: &RedirectRequest,
        status: &mut S,
    ) -> Result<(), RedirectError> {
        let pid = request.pid;
        let sync = StopSynchronizer::new(self.config.stop_timeout, self.config.poll_interval);

        debug!(pid = pid.as_raw(), stage = %RedirectStage::Start, path = %request.path.display());
        sync.stop(&mut self.jobs, pid, Signal::SIGTSTP, status);
        debug!(stage = %RedirectStage::Stopped);

        let result = match self.channel.attach(pid) {
            Ok(mut target) => {
                debug!(stage = %RedirectStage::Attached);
                let result = self.inject(&mut target, request);

                if let Err(source) = target.detach() {
                    let e = CleanupError::Channel { step: "detach", source };
                    warn!(error = ?e, "{}", e);
                }

                // 親プロセスにも再開が見えるように、一度停止させてから再開する
                sync.stop(&mut self.jobs, pid, Signal::SIGSTOP, status);
                result
            }
            Err(source) => Err(RedirectError::Attach {
                pid: pid.as_raw(),
                source,
            }),
        };

        match &result {
            Ok(()) => info!(
                pid = pid.as_raw(),
                "redirected stdout/stderr to {}",
                request.path.display()
            ),
            Err(e) => error!(pid = pid.as_raw(), error = ?e, "{}", e),
        }

        self.resume(pid);
        result
    }

    fn resume(&mut self, pid: Pid) {
        if let Err(e) = self.jobs.send(pid, Signal::SIGCONT) {
            warn!(pid = pid.as_raw(), error = %e, "failed to resume process");
        }
    }

    /// アタッチ済みの対象の中で open / dup2 を実行する
    ///
    /// 確保した資源はこの関数を抜けるときに逆順で解放されます。
    fn inject<T: RemoteTarget>(
        &self,
        target: &mut T,
        request: &RedirectRequest,
    ) -> Result<(), RedirectError> {
        target.advance_to_syscall().map_err(RedirectError::Boundary)?;
        debug!(pid = target.pid().as_raw(), stage = %RedirectStage::AtSyscallBoundary);

        let mut session = Session::new(target);

        session
            .target()
            .save_registers()
            .map_err(RedirectError::SaveRegisters)?;
        session.defer(Undo::RestoreRegisters);
        debug!(stage = %RedirectStage::RegistersSaved);

        let scratch = self.allocate_scratch(session.target())?;
        session.defer(Undo::Unmap(scratch));
        debug!(
            stage = %RedirectStage::ScratchAllocated,
            "allocated scratch page: 0x{:x}",
            scratch.addr
        );

        write_path(session.target(), scratch, request)?;
        debug!(stage = %RedirectStage::PathWritten);

        let fd = self.open_remote(session.target(), scratch)?;
        session.defer(Undo::Close(fd));
        debug!(
            stage = %RedirectStage::RemoteFileOpened,
            "opened the new log file in the process: {}",
            fd
        );

        for target_fd in REDIRECTED_FDS {
            dup_onto(session.target(), fd, target_fd)?;
            debug!(stage = %RedirectStage::redirected(target_fd));
        }

        debug!(stage = %RedirectStage::Success);
        Ok(())
    }

    /// スクラッチ領域を1ページ確保する
    ///
    /// mmap2 が使えればそれを、なければ mmap を使います。
    fn allocate_scratch<T: RemoteTarget>(
        &self,
        target: &mut T,
    ) -> Result<ScratchRegion, RedirectError> {
        let number = target
            .syscall_number(SyscallName::Mmap2)
            .or_else(|| target.syscall_number(SyscallName::Mmap))
            .ok_or(RedirectError::Alloc(Errno::ENOSYS))?;

        let len = self.config.page_size;
        let args = [
            0,
            len as u64,
            (libc::PROT_READ | libc::PROT_WRITE) as u64,
            (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE) as u64,
            -1i64 as u64,
            0,
        ];

        match target.remote_syscall(number, args) {
            Ok(SyscallReturn::Value(addr)) => Ok(ScratchRegion { addr, len }),
            Ok(SyscallReturn::Errno(errno)) => Err(RedirectError::Alloc(errno)),
            Err(e) => Err(RedirectError::Alloc(failure_errno(target, &e))),
        }
    }

    /// 対象プロセス内で出力先ファイルを開く
    fn open_remote<T: RemoteTarget>(
        &self,
        target: &mut T,
        scratch: ScratchRegion,
    ) -> Result<u64, RedirectError> {
        let number = target
            .syscall_number(SyscallName::Open)
            .ok_or(RedirectError::RemoteOpen(Errno::ENOSYS))?;

        let args = [
            scratch.addr,
            self.config.open_flags as u64,
            self.config.create_mode as u64,
            0,
            0,
            0,
        ];

        match target.remote_syscall(number, args) {
            Ok(SyscallReturn::Value(fd)) => Ok(fd),
            Ok(SyscallReturn::Errno(errno)) => Err(RedirectError::RemoteOpen(errno)),
            Err(e) => Err(RedirectError::RemoteOpen(failure_errno(target, &e))),
        }
    }
}

/// 出力先のパスを終端のNULを含めてスクラッチ領域に書き込む
fn write_path<T: RemoteTarget>(
    target: &mut T,
    scratch: ScratchRegion,
    request: &RedirectRequest,
) -> Result<(), RedirectError> {
    let path = request.path.as_os_str().as_bytes();
    if path.contains(&0) {
        return Err(RedirectError::Copy(Errno::EINVAL));
    }

    let mut bytes = Vec::with_capacity(path.len() + 1);
    bytes.extend_from_slice(path);
    bytes.push(0);

    if bytes.len() > scratch.len {
        return Err(RedirectError::Copy(Errno::ENAMETOOLONG));
    }

    match target.write_memory(scratch.addr, &bytes) {
        Ok(()) => Ok(()),
        Err(e) => Err(RedirectError::Copy(failure_errno(target, &e))),
    }
}

/// `dup2(fd, target_fd)` を実行し、戻り値が target_fd と一致することを確認する
fn dup_onto<T: RemoteTarget>(target: &mut T, fd: u64, target_fd: i32) -> Result<(), RedirectError> {
    let number = target
        .syscall_number(SyscallName::Dup2)
        .ok_or(RedirectError::Dup {
            target: target_fd,
            errno: Errno::ENOSYS,
        })?;

    match target.remote_syscall(number, [fd, target_fd as u64, 0, 0, 0, 0]) {
        Ok(SyscallReturn::Value(actual)) if actual == target_fd as u64 => Ok(()),
        Ok(SyscallReturn::Value(actual)) => Err(RedirectError::DupMismatch {
            target: target_fd,
            actual,
        }),
        Ok(SyscallReturn::Errno(errno)) => Err(RedirectError::Dup {
            target: target_fd,
            errno,
        }),
        Err(e) => Err(RedirectError::Dup {
            target: target_fd,
            errno: failure_errno(target, &e),
        }),
    }
}

/// チャネル操作の失敗を対象が最後に観測したエラー番号にする
fn failure_errno<T: RemoteTarget>(target: &T, e: &ChannelError) -> Errno {
    target.last_error().unwrap_or_else(|| e.errno())
}
