// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::runner::CommandRunner;
use crate::app::scheduler::parse_error;
use crate::app::scheduler::timestamps::from_epoch_secs;
use crate::app::services::shell::sh_escape;
use crate::app::types::{ExecutionRequest, ExecutionResult};

const LS_FLAGS: &str = "-l --quoting-style=c --time-style=+%s";
const STAT_FORMAT: &str = "%f|%i|%d|%h|%u|%g|%s|%X|%Y|%Z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub kind: FileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    pub permissions: String,
    pub links: u64,
    pub owner: String,
    pub group: String,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified: Option<OffsetDateTime>,
}

/// Raw `stat(2)` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub mode: u32,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileContent {
    pub content: String,
    pub truncated: bool,
}

/// Small remote filesystem operations, run as the caller over SSH.
#[derive(Clone)]
pub struct FilesystemOps {
    runner: Arc<dyn CommandRunner>,
}

impl FilesystemOps {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn run(&self, request: ExecutionRequest, path: &str) -> AppResult<ExecutionResult> {
        let result = self.runner.run(request).await?;
        if !result.success() && result.stderr.contains("No such file or directory") {
            return Err(AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("'{path}' does not exist"),
            ));
        }
        result.into_success()
    }

    pub async fn ls(&self, path: &str, show_hidden: bool) -> AppResult<Vec<FileEntry>> {
        let path = checked_path(path)?;
        let hidden = if show_hidden { " -A" } else { "" };
        let command = format!("ls {LS_FLAGS}{hidden} -- {}", sh_escape(path));
        let result = self.run(ExecutionRequest::new(command), path).await?;
        result
            .stdout
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with("total "))
            .map(parse_ls_line)
            .collect()
    }

    pub async fn stat(&self, path: &str, dereference: bool) -> AppResult<FileStat> {
        let path = checked_path(path)?;
        let follow = if dereference { " -L" } else { "" };
        let command = format!("stat{follow} --printf='{STAT_FORMAT}' -- {}", sh_escape(path));
        let result = self.run(ExecutionRequest::new(command), path).await?;
        parse_stat(&result.stdout)
    }

    /// Applies `mode` and returns the updated entry.
    pub async fn chmod(&self, path: &str, mode: &str) -> AppResult<FileEntry> {
        let path = checked_path(path)?;
        if !is_valid_mode(mode) {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                format!("invalid mode '{mode}'"),
            ));
        }
        let escaped = sh_escape(path);
        let command = format!(
            "chmod {} -- {escaped} && ls {LS_FLAGS} -d -- {escaped}",
            sh_escape(mode)
        );
        let result = self.run(ExecutionRequest::new(command), path).await?;
        let line = result
            .stdout
            .lines()
            .find(|line| !line.is_empty())
            .ok_or_else(|| parse_error("ls printed nothing after chmod"))?;
        parse_ls_line(line)
    }

    pub async fn rm(&self, path: &str) -> AppResult<()> {
        let path = checked_path(path)?;
        if path.trim_end_matches('/').is_empty() {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                "refusing to remove '/'",
            ));
        }
        let command = format!("rm -r --interactive=never -- {}", sh_escape(path));
        self.run(ExecutionRequest::new(command).with_side_effects(), path)
            .await?;
        Ok(())
    }

    pub async fn mkdir(&self, path: &str, parents: bool) -> AppResult<()> {
        let path = checked_path(path)?;
        let parents = if parents { " -p" } else { "" };
        let command = format!("mkdir{parents} -- {}", sh_escape(path));
        self.run(ExecutionRequest::new(command).with_side_effects(), path)
            .await?;
        Ok(())
    }

    /// First `max_bytes` of a file. The remote side also counts the raw
    /// bytes so truncation does not depend on how the text decodes.
    pub async fn view(&self, path: &str, max_bytes: usize) -> AppResult<FileContent> {
        let path = checked_path(path)?;
        let escaped = sh_escape(path);
        let command = format!(
            "head -c {max_bytes} -- {escaped} && printf '\\n%s' \"$(head -c {} -- {escaped} | wc -c)\"",
            max_bytes + 1
        );
        let result = self.run(ExecutionRequest::new(command), path).await?;
        if result.truncated {
            // The output cap cut the count off; keep what arrived.
            return Ok(FileContent {
                content: cut_at_boundary(result.stdout, max_bytes),
                truncated: true,
            });
        }
        let (content, count) = result
            .stdout
            .rsplit_once('\n')
            .ok_or_else(|| parse_error("head printed no byte count"))?;
        let count: usize = count
            .trim()
            .parse()
            .map_err(|_| parse_error(format!("invalid byte count '{}'", count.trim())))?;
        Ok(FileContent {
            content: content.to_string(),
            truncated: count > max_bytes,
        })
    }
}

fn cut_at_boundary(mut text: String, max_bytes: usize) -> String {
    if text.len() > max_bytes {
        let mut cut = max_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

fn checked_path(path: &str) -> AppResult<&str> {
    if path.starts_with('/') && !path.contains('\0') {
        Ok(path)
    } else {
        Err(AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            format!("path must be absolute: '{path}'"),
        ))
    }
}

/// Octal (`750`, `2775`) or symbolic (`u+x,go-w`) modes.
pub fn is_valid_mode(mode: &str) -> bool {
    if mode.is_empty() {
        return false;
    }
    if mode.bytes().all(|b| b.is_ascii_digit()) {
        return (3..=4).contains(&mode.len()) && mode.bytes().all(|b| (b'0'..=b'7').contains(&b));
    }
    mode.split(',').all(|clause| {
        let ops = clause.trim_start_matches(['u', 'g', 'o', 'a']);
        let mut chars = ops.chars().peekable();
        let mut saw_op = false;
        while let Some(op) = chars.next() {
            if !matches!(op, '+' | '-' | '=') {
                return false;
            }
            saw_op = true;
            while chars
                .peek()
                .is_some_and(|c| matches!(c, 'r' | 'w' | 'x' | 'X' | 's' | 't'))
            {
                chars.next();
            }
        }
        saw_op
    })
}

fn kind_of(permissions: &str) -> FileKind {
    match permissions.chars().next() {
        Some('-') => FileKind::File,
        Some('d') => FileKind::Directory,
        Some('l') => FileKind::Symlink,
        _ => FileKind::Other,
    }
}

/// Splits off the next space-separated field; ls pads columns with spaces.
fn take_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    let end = trimmed.find(' ')?;
    let (field, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(field)
}

/// `-rw-r--r-- 1 alice users 12 1709287200 "name"` with an optional
/// ` -> "target"` for symlinks.
fn parse_ls_line(line: &str) -> AppResult<FileEntry> {
    let bad = || parse_error(format!("unexpected ls line '{line}'"));
    let mut rest = line;
    let permissions = take_field(&mut rest).ok_or_else(bad)?.to_string();
    let links = take_field(&mut rest)
        .and_then(|field| field.parse().ok())
        .ok_or_else(bad)?;
    let owner = take_field(&mut rest).ok_or_else(bad)?.to_string();
    let group = take_field(&mut rest).ok_or_else(bad)?.to_string();
    let mut size_field = take_field(&mut rest).ok_or_else(bad)?;
    // Device files print "major, minor" instead of a size.
    if size_field.ends_with(',') {
        take_field(&mut rest).ok_or_else(bad)?;
        size_field = "0";
    }
    let size = size_field.parse().map_err(|_| bad())?;
    let modified: i64 = take_field(&mut rest)
        .and_then(|field| field.parse().ok())
        .ok_or_else(bad)?;

    let (name, after) = read_c_quoted(rest.trim_start()).ok_or_else(bad)?;
    let link_target = match after.trim_start().strip_prefix("->") {
        Some(target) => Some(read_c_quoted(target.trim_start()).ok_or_else(bad)?.0),
        None => None,
    };
    let name = name.rsplit('/').next().unwrap_or(&name).to_string();
    Ok(FileEntry {
        kind: kind_of(&permissions),
        name,
        link_target,
        permissions,
        links,
        owner,
        group,
        size,
        modified: from_epoch_secs(modified),
    })
}

/// Reads one `"..."` string as printed by `ls --quoting-style=c`, returning
/// the decoded text and the remainder of the input.
fn read_c_quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut bytes = Vec::new();
    let mut iter = body.char_indices();
    while let Some((idx, c)) = iter.next() {
        match c {
            '"' => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                return Some((text, &body[idx + 1..]));
            }
            '\\' => {
                let (_, escaped) = iter.next()?;
                match escaped {
                    'n' => bytes.push(b'\n'),
                    't' => bytes.push(b'\t'),
                    'r' => bytes.push(b'\r'),
                    'a' => bytes.push(0x07),
                    'b' => bytes.push(0x08),
                    'f' => bytes.push(0x0c),
                    'v' => bytes.push(0x0b),
                    '0'..='7' => {
                        let mut value = escaped.to_digit(8)?;
                        for _ in 0..2 {
                            let (_, digit) = iter.next()?;
                            value = value * 8 + digit.to_digit(8)?;
                        }
                        bytes.push(u8::try_from(value).ok()?);
                    }
                    other => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
            other => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    None
}

fn parse_stat(stdout: &str) -> AppResult<FileStat> {
    let fields: Vec<&str> = stdout.trim().split('|').collect();
    let &[mode, ino, dev, nlink, uid, gid, size, atime, mtime, ctime] = fields.as_slice() else {
        return Err(parse_error(format!("unexpected stat output '{}'", stdout.trim())));
    };
    let bad = |field: &str| parse_error(format!("invalid stat field '{field}'"));
    Ok(FileStat {
        mode: u32::from_str_radix(mode, 16).map_err(|_| bad(mode))?,
        ino: ino.parse().map_err(|_| bad(ino))?,
        dev: dev.parse().map_err(|_| bad(dev))?,
        nlink: nlink.parse().map_err(|_| bad(nlink))?,
        uid: uid.parse().map_err(|_| bad(uid))?,
        gid: gid.parse().map_err(|_| bad(gid))?,
        size: size.parse().map_err(|_| bad(size))?,
        atime: atime.parse().map_err(|_| bad(atime))?,
        mtime: mtime.parse().map_err(|_| bad(mtime))?,
        ctime: ctime.parse().map_err(|_| bad(ctime))?,
    })
}
