//! 対象プロセスの停止同期
//!
//! ptraceの停止ではなく通常のシグナルで止めることで、対象の本来の親
//! （シェルなど）にもジョブの停止が見えるようにします。停止の確認は
//! waitではなく /proc/pid/stat のポーリングで行います。

use crate::stat::StatusSource;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// シグナルの送信
pub trait JobControl {
    /// プロセスにシグナルを送る
    fn send(&mut self, pid: Pid, signal: Signal) -> nix::Result<()>;
}

/// kill(2) によるシグナル送信
#[derive(Debug, Default, Clone, Copy)]
pub struct KillSignals;

impl JobControl for KillSignals {
    fn send(&mut self, pid: Pid, signal: Signal) -> nix::Result<()> {
        signal::kill(pid, signal)
    }
}

/// 停止待ちの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 停止状態を確認できた
    Stopped,
    /// タイムアウトした
    TimedOut,
    /// 状態を読み取れなくなった
    Unavailable,
}

/// 停止同期
#[derive(Debug, Clone, Copy)]
pub struct StopSynchronizer {
    timeout: Duration,
    interval: Duration,
}

impl StopSynchronizer {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// 停止状態になるまでポーリングする
    ///
    /// タイムアウトや読み取り失敗は致命的ではありません。対象がシグナルを
    /// 無視していても以降の処理は動作し、親から見たジョブ状態が
    /// 更新されないだけです。
    pub fn wait_for_stop<S: StatusSource>(&self, status: &mut S) -> StopOutcome {
        let start = Instant::now();
        loop {
            if start.elapsed() >= self.timeout {
                warn!("Timed out waiting for process stop");
                return StopOutcome::TimedOut;
            }

            match status.snapshot() {
                Ok(snapshot) if snapshot.is_stopped() => {
                    debug!(pid = snapshot.pid, comm = %snapshot.comm, "process stopped");
                    return StopOutcome::Stopped;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "status unavailable, giving up stop wait");
                    return StopOutcome::Unavailable;
                }
            }

            thread::sleep(self.interval);
        }
    }

    /// シグナルを送り、停止状態になるまで待つ
    ///
    /// シグナル送信に失敗した場合も待機は行います。
    pub fn stop<J: JobControl, S: StatusSource>(
        &self,
        jobs: &mut J,
        pid: Pid,
        signal: Signal,
        status: &mut S,
    ) -> StopOutcome {
        if let Err(e) = jobs.send(pid, signal) {
            warn!(pid = pid.as_raw(), ?signal, error = %e, "failed to send stop signal");
        }
        self.wait_for_stop(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StatusError;
    use crate::stat::ProcessSnapshot;
    use std::path::PathBuf;

    /// 指定回数だけ実行中を返し、その後停止状態を返す
    struct Scripted {
        running_polls: usize,
        polls: usize,
        fail: bool,
    }

    impl StatusSource for Scripted {
        fn snapshot(&mut self) -> Result<ProcessSnapshot, StatusError> {
            self.polls += 1;
            if self.fail {
                return Err(StatusError::Read {
                    path: PathBuf::from("/proc/1/stat"),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            let state = if self.polls > self.running_polls { 'T' } else { 'R' };
            Ok(ProcessSnapshot {
                pid: 1,
                comm: "target".to_string(),
                state,
                ppid: 0,
                sid: 1,
                pgid: 1,
                ctty: 0,
            })
        }
    }

    #[derive(Default)]
    struct Recorder(Vec<(Pid, Signal)>);

    impl JobControl for Recorder {
        fn send(&mut self, pid: Pid, signal: Signal) -> nix::Result<()> {
            self.0.push((pid, signal));
            Ok(())
        }
    }

    fn sync() -> StopSynchronizer {
        StopSynchronizer::new(Duration::from_millis(200), Duration::from_millis(1))
    }

    #[test]
    fn test_stops_after_polls() {
        let mut status = Scripted { running_polls: 3, polls: 0, fail: false };
        assert_eq!(sync().wait_for_stop(&mut status), StopOutcome::Stopped);
        assert_eq!(status.polls, 4);
    }

    #[test]
    fn test_times_out_without_failing() {
        let mut status = Scripted { running_polls: usize::MAX, polls: 0, fail: false };
        let start = Instant::now();
        let sync = StopSynchronizer::new(Duration::from_millis(30), Duration::from_millis(5));
        assert_eq!(sync.wait_for_stop(&mut status), StopOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(status.polls >= 1);
    }

    #[test]
    fn test_unreadable_status_gives_up() {
        let mut status = Scripted { running_polls: 0, polls: 0, fail: true };
        assert_eq!(sync().wait_for_stop(&mut status), StopOutcome::Unavailable);
        assert_eq!(status.polls, 1);
    }

    #[test]
    fn test_stop_sends_signal_first() {
        let mut jobs = Recorder::default();
        let mut status = Scripted { running_polls: 0, polls: 0, fail: false };
        let pid = Pid::from_raw(1);
        let outcome = sync().stop(&mut jobs, pid, Signal::SIGTSTP, &mut status);
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(jobs.0, vec![(pid, Signal::SIGTSTP)]);
    }
}
