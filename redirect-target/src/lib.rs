//! redirect ターゲットプロセス制御
//!
//! このクレートは、実行中のプロセスにptraceでアタッチし、
//! そのプロセスに代わってシステムコールを実行するための低レベル機能を提供します。
//! レジスタの保存と復元、/proc/pid/mem 経由のメモリ書き込み、
//! システムコール番号の解決などを行います。

pub mod channel;
pub mod error;
pub mod memory;
pub mod process;
pub mod registers;
pub mod syscall;

pub use channel::{RemoteChannel, RemoteTarget};
pub use error::ChannelError;
pub use memory::{page_size, Memory};
pub use process::{Ptrace, Tracee};
pub use registers::Registers;
pub use syscall::{SyscallName, SyscallReturn};

/// ターゲット制御の結果型
pub type Result<T> = std::result::Result<T, ChannelError>;
