//! メモリアクセス機能

use crate::{ChannelError, Result};
use nix::unistd::{sysconf, Pid, SysconfVar};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

/// ページサイズの取得に失敗した場合の値
const FALLBACK_PAGE_SIZE: usize = 4096;

/// システムのページサイズを取得する
pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリにデータを書き込む
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリに書き込みます。
    /// 書き込みは1回の位置指定書き込みで行います。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let to_error = |source| ChannelError::MemoryWrite {
            addr,
            len: data.len(),
            source,
        };

        let file = OpenOptions::new()
            .write(true)
            .open(self.mem_path())
            .map_err(to_error)?;

        file.write_all_at(data, addr).map_err(to_error)?;

        Ok(())
    }
}
