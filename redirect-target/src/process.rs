//! プロセス制御機能

use crate::registers::{self, Registers};
use crate::{ChannelError, Memory, RemoteChannel, RemoteTarget, Result, SyscallName, SyscallReturn};
use nix::errno::Errno;
use nix::libc::user_regs_struct;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// トレース対象の停止位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceState {
    /// アタッチ直後などのシグナル停止
    Stopped,
    /// システムコール入口での停止
    AtSyscall,
    /// システムコール出口での停止
    AfterSyscall,
}

/// ptraceによるリモート実行チャネル
#[derive(Debug, Default, Clone, Copy)]
pub struct Ptrace;

impl RemoteChannel for Ptrace {
    type Target = Tracee;

    fn attach(&mut self, pid: Pid) -> Result<Tracee> {
        Tracee::attach(pid.as_raw())
    }
}

/// アタッチ済みのトレース対象プロセス
pub struct Tracee {
    pid: Pid,
    state: TraceState,
    registers: Registers,
    memory: Memory,
    /// 保存済みレジスタ（保存から復元までの間だけ存在する）
    saved: Option<user_regs_struct>,
    /// 受け取って保留しているシグナル
    signals: HeldSignals,
    last_error: Option<Errno>,
}

impl Tracee {
    /// 既存のプロセスにアタッチする
    ///
    /// アタッチ停止を待ち、システムコール停止を区別するために
    /// PTRACE_O_TRACESYSGOOD を設定します。
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid).map_err(ChannelError::ptrace("attach"))?;

        let mut tracee = Self {
            pid,
            state: TraceState::Stopped,
            registers: Registers::new(pid.as_raw()),
            memory: Memory::new(pid.as_raw()),
            saved: None,
            signals: HeldSignals::default(),
            last_error: None,
        };

        if let Err(e) = tracee.wait_for_attach() {
            let _ = ptrace::detach(pid, None);
            return Err(e);
        }

        debug!(pid = pid.as_raw(), "attached");
        Ok(tracee)
    }

    fn wait_for_attach(&mut self) -> Result<()> {
        match self.wait()? {
            WaitStatus::Stopped(_, _) => {}
            status => {
                return Err(ChannelError::UnexpectedStop(format!(
                    "unexpected wait status after attach: {:?}",
                    status
                )))
            }
        }
        let options = ptrace::Options::PTRACE_O_TRACESYSGOOD;
        ptrace::setoptions(self.pid, options).map_err(ChannelError::ptrace("setoptions"))
    }

    fn wait(&mut self) -> Result<WaitStatus> {
        let status = waitpid(self.pid, Some(WaitPidFlag::__WALL)).map_err(ChannelError::Wait)?;
        match status {
            WaitStatus::Exited(_, code) => Err(ChannelError::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Err(ChannelError::Killed(signal)),
            status => Ok(status),
        }
    }

    /// 次のシステムコール停止まで実行する
    ///
    /// 途中で受け取ったシグナルは次の再開時に配送し直します。
    /// レジスタを保存してから復元するまでの間は配送せずに保留します。
    /// ジョブ制御の停止シグナルだけは捨てます。
    fn step_to_syscall_stop(&mut self) -> Result<()> {
        loop {
            let signal = self.signals.next_for_resume(self.saved.is_some());
            ptrace::syscall(self.pid, signal).map_err(ChannelError::ptrace("syscall"))?;

            match self.wait()? {
                WaitStatus::PtraceSyscall(_) => {
                    self.state = match self.state {
                        TraceState::AtSyscall => TraceState::AfterSyscall,
                        TraceState::Stopped | TraceState::AfterSyscall => TraceState::AtSyscall,
                    };
                    trace!(pid = self.pid.as_raw(), state = ?self.state, "syscall stop");
                    return Ok(());
                }
                WaitStatus::Stopped(_, signal) => {
                    trace!(pid = self.pid.as_raw(), ?signal, "signal stop");
                    if !is_stop_signal(signal) {
                        self.signals.hold(signal);
                    }
                }
                status => {
                    trace!(pid = self.pid.as_raw(), ?status, "ignoring wait status");
                }
            }
        }
    }

    fn advance_to(&mut self, target: TraceState) -> Result<()> {
        while self.state != target {
            self.step_to_syscall_stop()?;
        }
        Ok(())
    }

    /// 失敗を記録してそのまま返す
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.errno());
        }
        result
    }

    fn inject(&mut self, number: i64, args: [u64; 6]) -> Result<SyscallReturn> {
        let saved = self.saved.ok_or(ChannelError::RegistersNotSaved)?;

        self.advance_to(TraceState::AtSyscall)?;

        let mut regs = saved;
        registers::load_syscall(&mut regs, number, args);
        self.registers.write(regs)?;

        self.advance_to(TraceState::AfterSyscall)?;
        let raw = self.registers.syscall_return()?;

        // 次の注入が同じsyscall命令から入れるように巻き戻した状態に戻す
        self.registers.write(saved)?;

        let ret = SyscallReturn::decode(raw);
        trace!(pid = self.pid.as_raw(), number, ?ret, "remote syscall");
        Ok(ret)
    }

    fn restore(&mut self) -> Result<()> {
        let saved = self.saved.ok_or(ChannelError::RegistersNotSaved)?;

        if self.state == TraceState::AtSyscall {
            // 未実行のシステムコールが復元後に二重実行されないよう取り消す
            let mut regs = self.registers.read()?;
            registers::cancel_syscall(&mut regs);
            self.registers.write(regs)?;
            self.advance_to(TraceState::AfterSyscall)?;
        }

        self.registers.write(saved)?;
        self.saved = None;
        Ok(())
    }
}

impl RemoteTarget for Tracee {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn advance_to_syscall(&mut self) -> Result<()> {
        let result = self.advance_to(TraceState::AtSyscall);
        self.record(result)
    }

    fn save_registers(&mut self) -> Result<()> {
        let result = self.registers.read();
        let mut regs = self.record(result)?;
        if self.state == TraceState::AtSyscall {
            registers::rewind_to_syscall(&mut regs);
        }
        self.saved = Some(regs);
        Ok(())
    }

    fn restore_registers(&mut self) -> Result<()> {
        let result = self.restore();
        self.record(result)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let result = self.memory.write(addr, data);
        self.record(result)
    }

    fn remote_syscall(&mut self, number: i64, args: [u64; 6]) -> Result<SyscallReturn> {
        let result = self.inject(number, args);
        self.record(result)
    }

    fn syscall_number(&self, name: SyscallName) -> Option<i64> {
        name.number()
    }

    fn last_error(&self) -> Option<Errno> {
        self.last_error
    }

    fn detach(mut self) -> Result<()> {
        let (first, rest) = self.signals.drain_for_detach();

        // デタッチ時に渡せるのは1つだけなので、残りは送り直して保留させる
        for signal in rest {
            if let Err(e) = signal::kill(self.pid, signal) {
                warn!(pid = self.pid.as_raw(), ?signal, error = %e, "failed to re-raise signal");
            }
        }

        ptrace::detach(self.pid, first).map_err(ChannelError::ptrace("detach"))?;
        debug!(pid = self.pid.as_raw(), ?first, "detached");
        Ok(())
    }
}

/// トレース中に受け取ったシグナルの保留キュー
#[derive(Debug, Default)]
struct HeldSignals {
    queue: VecDeque<Signal>,
}

impl HeldSignals {
    fn hold(&mut self, signal: Signal) {
        if !self.queue.contains(&signal) {
            self.queue.push_back(signal);
        }
    }

    /// 再開時に配送するシグナル（レジスタを借用中なら配送しない）
    fn next_for_resume(&mut self, borrowed: bool) -> Option<Signal> {
        if borrowed {
            None
        } else {
            self.queue.pop_front()
        }
    }

    /// デタッチ時に渡すシグナルと、送り直すシグナル
    fn drain_for_detach(&mut self) -> (Option<Signal>, Vec<Signal>) {
        let first = self.queue.pop_front();
        (first, self.queue.drain(..).collect())
    }
}

/// ジョブ制御による停止シグナルかどうか
fn is_stop_signal(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_stop_signal() {
        assert!(is_stop_signal(Signal::SIGSTOP));
        assert!(is_stop_signal(Signal::SIGTSTP));
        assert!(!is_stop_signal(Signal::SIGCHLD));
        assert!(!is_stop_signal(Signal::SIGINT));
    }

    #[test]
    fn test_signals_held_while_registers_borrowed() {
        let mut signals = HeldSignals::default();
        signals.hold(Signal::SIGUSR1);
        signals.hold(Signal::SIGUSR1);
        signals.hold(Signal::SIGINT);

        assert_eq!(signals.next_for_resume(true), None);
        assert_eq!(signals.next_for_resume(false), Some(Signal::SIGUSR1));
        assert_eq!(signals.next_for_resume(false), Some(Signal::SIGINT));
        assert_eq!(signals.next_for_resume(false), None);
    }

    #[test]
    fn test_signals_handed_back_on_detach() {
        let mut signals = HeldSignals::default();
        assert_eq!(signals.drain_for_detach(), (None, vec![]));

        // 最後の注入中に届いたシグナルも失われない
        signals.hold(Signal::SIGUSR1);
        signals.hold(Signal::SIGCHLD);
        signals.hold(Signal::SIGTERM);
        assert_eq!(
            signals.drain_for_detach(),
            (Some(Signal::SIGUSR1), vec![Signal::SIGCHLD, Signal::SIGTERM])
        );
        assert_eq!(signals.drain_for_detach(), (None, vec![]));
    }

    #[test]
    fn test_attach_nonexistent_process() {
        // PIDの上限を超える値には誰もアタッチできない
        let err = Tracee::attach(i32::MAX).err().expect("attach should fail");
        assert!(matches!(err.errno(), Errno::ESRCH | Errno::EPERM));
    }
}
