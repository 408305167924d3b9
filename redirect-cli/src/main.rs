//! redirect CLI - コマンドラインインターフェース
//!
//! 実行中のプロセスの標準出力と標準エラー出力をファイルへ付け替える

use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use redirect_core::{redirect_process, RedirectConfig, RedirectRequest};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// redirect - Redirect the output of a running process
#[derive(Parser, Debug)]
#[command(name = "redirect")]
#[command(version)]
#[command(about = "Redirect stdout/stderr of a running process to a file", long_about = None)]
struct Cli {
    /// PID of the process to redirect
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pid_flag: Option<i32>,

    /// stdout/stderr output file
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out_flag: Option<PathBuf>,

    /// PID of the process to redirect (overrides --pid)
    #[arg(value_name = "PID")]
    pid: Option<i32>,

    /// stdout/stderr output file (overrides --out)
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// How long to wait for the process to stop, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    stop_timeout: u64,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// 引数からリダイレクト要求を組み立てる
    ///
    /// 位置引数が指定されていればオプションより優先します。
    fn request(&self) -> Result<RedirectRequest> {
        let pid = self.pid.or(self.pid_flag).unwrap_or(0);
        if pid <= 0 {
            bail!("PID missing");
        }

        let Some(file) = self.file.as_ref().or(self.out_flag.as_ref()) else {
            bail!("output file missing");
        };

        Ok(RedirectRequest::new(pid, file.clone()))
    }

    fn config(&self) -> RedirectConfig {
        RedirectConfig::default().with_stop_timeout(Duration::from_millis(self.stop_timeout))
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => return usage_error(e),
    };
    init_tracing(cli.verbose);

    let request = match cli.request() {
        Ok(request) => request,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match redirect_process(&request, cli.config()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(exit_status(e.exit_code())),
    }
}

/// 引数の解析エラーを処理する
///
/// ヘルプとバージョン表示は成功扱い、それ以外は終了ステータス1にします。
fn usage_error(e: clap::Error) -> ExitCode {
    let _ = e.print();
    if e.use_stderr() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// ログ出力を初期化する
///
/// RUST_LOG が設定されていればそれを優先します。
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// 終了ステータスに変換する（範囲外の値は1にする）
fn exit_status(code: i32) -> u8 {
    match u8::try_from(code) {
        Ok(0) | Err(_) => 1,
        Ok(code) => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("redirect").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_positional_arguments() {
        let request = parse(&["1234", "/tmp/out.log"]).request().unwrap();
        assert_eq!(request, RedirectRequest::new(1234, "/tmp/out.log"));
    }

    #[test]
    fn test_flag_arguments() {
        let request = parse(&["-p", "42", "--out", "/tmp/a.log"]).request().unwrap();
        assert_eq!(request, RedirectRequest::new(42, "/tmp/a.log"));
    }

    #[test]
    fn test_positional_overrides_flags() {
        let request = parse(&["--pid", "1", "-o", "/tmp/a.log", "77", "/tmp/b.log"])
            .request()
            .unwrap();
        assert_eq!(request, RedirectRequest::new(77, "/tmp/b.log"));
    }

    #[test]
    fn test_missing_arguments() {
        let err = parse(&[]).request().unwrap_err();
        assert_eq!(err.to_string(), "PID missing");

        let err = parse(&["1234"]).request().unwrap_err();
        assert_eq!(err.to_string(), "output file missing");

        let err = parse(&["0", "/tmp/out.log"]).request().unwrap_err();
        assert_eq!(err.to_string(), "PID missing");
    }

    #[test]
    fn test_invalid_pid() {
        assert!(Cli::try_parse_from(["redirect", "abc", "/tmp/out.log"]).is_err());
    }

    #[test]
    fn test_help_is_not_an_error_kind() {
        let err = Cli::try_parse_from(["redirect", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        assert_eq!(err.exit_code(), 0);
    }

    #[test]
    fn test_stop_timeout_option() {
        let cli = parse(&["--stop-timeout", "250", "1", "/tmp/out.log"]);
        assert_eq!(cli.config().stop_timeout, Duration::from_millis(250));
        assert_eq!(parse(&["1", "x"]).config().stop_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_exit_code_conversion() {
        assert_eq!(exit_status(13), 13);
        assert_eq!(exit_status(1), 1);
        assert_eq!(exit_status(0), 1);
        assert_eq!(exit_status(-5), 1);
        assert_eq!(exit_status(4096), 1);
    }
}
