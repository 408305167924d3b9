//! /proc/pid/stat の読み取りと解析
//!
//! 書式は `"%d (%16[^)]) %c %d %d %d %u"` と同じ規則で解析します。
//! プロセス名は最初の `)` までを名前として扱うため、名前に `)` を含む
//! プロセスは正しく解析できません（既知の制約）。

use crate::errors::StatusError;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// プロセス名の最大長（TASK_COMM_LEN - 1）
pub const TASK_COMM_LENGTH: usize = 16;

/// 1回の読み取りで取得するバイト数
const STAT_BUFFER_SIZE: usize = 1024;

/// プロセス状態のスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: i32,
    /// プロセス名（最大16バイト）
    pub comm: String,
    /// 実行状態（'R', 'S', 'T' など）
    pub state: char,
    pub ppid: i32,
    pub sid: i32,
    pub pgid: i32,
    /// 制御端末のデバイス番号
    pub ctty: u32,
}

impl ProcessSnapshot {
    /// 停止状態かどうか
    pub fn is_stopped(&self) -> bool {
        self.state == 'T'
    }
}

/// プロセス状態の取得元
pub trait StatusSource {
    /// 最新のスナップショットを取得する
    fn snapshot(&mut self) -> Result<ProcessSnapshot, StatusError>;
}

/// /proc/pid/stat の読み取り
///
/// ハンドルは開いたまま保持し、読み取りのたびに先頭へシークします。
pub struct StatusReader<R> {
    handle: R,
    path: PathBuf,
}

impl StatusReader<File> {
    /// /proc/pid/stat を開く
    pub fn open(pid: i32) -> Result<Self, StatusError> {
        let path = stat_path(pid);
        match File::open(&path) {
            Ok(handle) => Ok(Self { handle, path }),
            Err(source) => Err(StatusError::Read { path, source }),
        }
    }
}

impl<R: Read + Seek> StatusReader<R> {
    /// 開いているハンドルから読み取りを作成する
    pub fn new(handle: R) -> Self {
        Self {
            handle,
            path: PathBuf::from("<status record>"),
        }
    }

    /// レコードを読み取って解析する
    pub fn read(&mut self) -> Result<ProcessSnapshot, StatusError> {
        let to_error = |source| StatusError::Read {
            path: self.path.clone(),
            source,
        };

        self.handle.seek(SeekFrom::Start(0)).map_err(to_error)?;
        let mut buf = [0u8; STAT_BUFFER_SIZE];
        let n = self.handle.read(&mut buf).map_err(to_error)?;

        parse_stat(&buf[..n])
    }
}

impl<R: Read + Seek> StatusSource for StatusReader<R> {
    fn snapshot(&mut self) -> Result<ProcessSnapshot, StatusError> {
        self.read()
    }
}

/// /proc/pid/stat のパス
pub fn stat_path(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{}/stat", pid))
}

/// statレコードを解析する
///
/// 7つのフィールドがすべて変換できなければ解析エラーになります。
/// 名前の長さはバイト単位で数えます。
pub fn parse_stat(record: &[u8]) -> Result<ProcessSnapshot, StatusError> {
    let mut scanner = Scanner::new(record);

    if scanner.at_end() {
        return Err(StatusError::Parse {
            fields: 0,
            record: String::new(),
        });
    }

    let mut fields = 0;
    let fail = |fields| StatusError::Parse {
        fields,
        record: String::from_utf8_lossy(record).chars().take(80).collect(),
    };

    let pid = scanner.int().ok_or_else(|| fail(fields))?;
    fields += 1;

    scanner.whitespace();
    scanner.literal(b'(').ok_or_else(|| fail(fields))?;
    let comm = scanner
        .until(b')', TASK_COMM_LENGTH)
        .ok_or_else(|| fail(fields))?;
    fields += 1;
    scanner.literal(b')').ok_or_else(|| fail(fields))?;

    scanner.whitespace();
    let state = scanner.next_byte().ok_or_else(|| fail(fields))?;
    fields += 1;

    scanner.whitespace();
    let ppid = scanner.int().ok_or_else(|| fail(fields))?;
    fields += 1;
    scanner.whitespace();
    let sid = scanner.int().ok_or_else(|| fail(fields))?;
    fields += 1;
    scanner.whitespace();
    let pgid = scanner.int().ok_or_else(|| fail(fields))?;
    fields += 1;
    scanner.whitespace();
    let ctty = scanner.unsigned().ok_or_else(|| fail(fields))?;

    Ok(ProcessSnapshot {
        pid,
        comm: String::from_utf8_lossy(comm).into_owned(),
        state: char::from(state),
        ppid,
        sid,
        pgid,
        ctty,
    })
}

/// scanf相当の字句走査
struct Scanner<'a> {
    rest: &'a [u8],
}

impl<'a> Scanner<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { rest: input }
    }

    fn at_end(&self) -> bool {
        self.rest.trim_ascii_start().is_empty()
    }

    /// 0個以上の空白を読み飛ばす
    fn whitespace(&mut self) {
        self.rest = self.rest.trim_ascii_start();
    }

    fn literal(&mut self, c: u8) -> Option<()> {
        self.rest = self.rest.strip_prefix(&[c])?;
        Some(())
    }

    fn next_byte(&mut self) -> Option<u8> {
        let (&c, rest) = self.rest.split_first()?;
        self.rest = rest;
        Some(c)
    }

    /// `%N[^c]`: 区切り文字以外を1〜N バイト読む
    fn until(&mut self, delim: u8, max: usize) -> Option<&'a [u8]> {
        let end = self
            .rest
            .iter()
            .take(max)
            .position(|&c| c == delim)
            .unwrap_or_else(|| self.rest.len().min(max));
        if end == 0 {
            return None;
        }
        let (taken, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(taken)
    }

    /// 符号と数字の並びを切り出す（先頭の空白は読み飛ばす）
    fn number_token(&mut self) -> Option<(bool, &'a str)> {
        self.whitespace();
        let mut negative = false;
        if let Some(rest) = self.rest.strip_prefix(b"-") {
            negative = true;
            self.rest = rest;
        } else if let Some(rest) = self.rest.strip_prefix(b"+") {
            self.rest = rest;
        }
        let len = self
            .rest
            .iter()
            .position(|c| !c.is_ascii_digit())
            .unwrap_or(self.rest.len());
        if len == 0 {
            return None;
        }
        let (digits, rest) = self.rest.split_at(len);
        self.rest = rest;
        // ASCII数字のみなので失敗しない
        let digits = std::str::from_utf8(digits).ok()?;
        Some((negative, digits))
    }

    /// `%d`
    fn int(&mut self) -> Option<i32> {
        let (negative, digits) = self.number_token()?;
        let value = digits.parse::<i64>().ok()?;
        let value = if negative { -value } else { value };
        i32::try_from(value).ok()
    }

    /// `%u`（負の値はscanfと同様に折り返す）
    fn unsigned(&mut self) -> Option<u32> {
        let (negative, digits) = self.number_token()?;
        let value = digits.parse::<u32>().ok()?;
        Some(if negative { value.wrapping_neg() } else { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const RECORD: &str = "4242 (bash) S 4200 4242 4242 34816 4242 4194560 1234 0 0 0";

    #[test]
    fn test_parse_stat() {
        let snapshot = parse_stat(RECORD.as_bytes()).unwrap();
        assert_eq!(
            snapshot,
            ProcessSnapshot {
                pid: 4242,
                comm: "bash".to_string(),
                state: 'S',
                ppid: 4200,
                sid: 4242,
                pgid: 4242,
                ctty: 34816,
            }
        );
        assert!(!snapshot.is_stopped());
    }

    #[test]
    fn test_parse_stat_stopped_with_spaces_in_name() {
        let snapshot = parse_stat(b"17 (tmux: server) T 1 17 17 0 -1").unwrap();
        assert_eq!(snapshot.comm, "tmux: server");
        assert!(snapshot.is_stopped());
        assert_eq!(snapshot.ctty, 0);
    }

    #[test]
    fn test_parse_stat_name_with_paren_is_misparsed() {
        // 名前の途中の ')' で区切られてしまう
        assert!(parse_stat(b"99 (a) b) R 1 99 99 0").is_err());

        let snapshot = parse_stat(b"99 (x) 7) R 1 99 99 0");
        assert!(snapshot.map(|s| s.comm != "x) 7").unwrap_or(true));
    }

    #[test]
    fn test_parse_stat_long_name() {
        let name = "abcdefghijklmnop";
        let snapshot = parse_stat(format!("5 ({}) R 1 5 5 0", name).as_bytes()).unwrap();
        assert_eq!(snapshot.comm, name);

        // 17バイト目で名前が打ち切られ、')' が見つからない
        assert!(parse_stat(b"5 (abcdefghijklmnopq) R 1 5 5 0").is_err());
    }

    #[test]
    fn test_parse_stat_truncated_multibyte_name() {
        // カーネルが名前をバイト単位で切り詰めるため、UTF-8の途中で終わることがある
        let record = b"77 (aaaaaaaaaaaaaa\xc3) T 1 77 77 0 1 2 3";
        let snapshot = StatusReader::new(Cursor::new(record.to_vec())).read().unwrap();
        assert_eq!(snapshot.pid, 77);
        assert_eq!(snapshot.comm, "aaaaaaaaaaaaaa\u{fffd}");
        assert!(snapshot.is_stopped());
        assert_eq!((snapshot.ppid, snapshot.sid, snapshot.pgid, snapshot.ctty), (1, 77, 77, 0));

        // 16バイトちょうどの名前（マルチバイト文字を含む）
        let snapshot = parse_stat("9 (あああああa) S 1 9 9 0".as_bytes()).unwrap();
        assert_eq!(snapshot.comm, "あああああa");
    }

    #[test]
    fn test_parse_stat_missing_fields() {
        assert!(matches!(
            parse_stat(b"1 (init) S 0 1"),
            Err(StatusError::Parse { fields: 5, .. })
        ));
        assert!(matches!(
            parse_stat(b"garbage"),
            Err(StatusError::Parse { fields: 0, .. })
        ));
        assert!(matches!(
            parse_stat(b""),
            Err(StatusError::Parse { fields: 0, .. })
        ));
        assert!(parse_stat(b"1 () S 0 1 1 0").is_err());
    }

    #[test]
    fn test_reader_rereads_from_start() {
        let mut reader = StatusReader::new(Cursor::new(RECORD.as_bytes().to_vec()));
        let first = reader.read().unwrap();
        let second = reader.snapshot().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reader_own_process() {
        let mut reader = StatusReader::open(std::process::id() as i32).unwrap();
        let snapshot = reader.read().unwrap();
        assert_eq!(snapshot.pid, std::process::id() as i32);
        assert!(!snapshot.comm.is_empty());
    }

    #[test]
    fn test_reader_missing_process() {
        assert!(matches!(
            StatusReader::open(i32::MAX),
            Err(StatusError::Read { .. })
        ));
    }
}
