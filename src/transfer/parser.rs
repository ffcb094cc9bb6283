//! Line-oriented parsing of rsync's stats and progress output.
//!
//! rsync overwrites its per-file progress line in place using carriage
//! returns, so the accumulator treats `\r` as a line terminator just like
//! `\n` and buffers partial lines across read chunks.

/// Accumulates raw output chunks and yields completed lines.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    buf: String,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the lines completed by it (empty lines are
    /// dropped, so `\r\n` does not produce a phantom line).
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.buf.find(|c| c == '\n' || c == '\r') {
            let line = self.buf[..idx].to_string();
            self.buf.drain(..=idx);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Drain whatever is left after the stream ends.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// One parsed `--progress` update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileProgress {
    /// Bytes of the current file transferred so far.
    pub bytes: u64,
    /// True when the line carries the parenthesised remaining-file-count
    /// suffix rsync prints once a file is done, e.g. `(xfr#3, to-chk=5/9)`.
    /// Only finished lines may be accumulated, otherwise in-flight updates
    /// for the same file would be double counted.
    pub finished: bool,
}

/// Parse a `--progress` line such as
/// `     1,238,099 100%  936.37kB/s  0:00:01 (xfr#1, to-chk=0/4)`.
/// Returns `None` for anything else (typically a file path being listed).
pub fn parse_progress_line(line: &str) -> Option<FileProgress> {
    let mut tokens = line.split_whitespace();
    let bytes = parse_grouped_number(tokens.next()?)?;
    let percent = tokens.next()?.strip_suffix('%')?;
    if percent.is_empty() || !percent.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(FileProgress {
        bytes,
        finished: line.contains('('),
    })
}

/// Extract the byte count from the `--stats` summary line
/// `Total transferred file size: 1,234,567 bytes`.
pub fn parse_total_transferred(line: &str) -> Option<u64> {
    let rest = line.trim().strip_prefix("Total transferred file size:")?;
    parse_grouped_number(rest.split_whitespace().next()?)
}

/// Parse a digit-grouped number like `1,238,099`.
fn parse_grouped_number(token: &str) -> Option<u64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit() || b == b',') {
        return None;
    }
    let digits: String = token.chars().filter(|c| *c != ',').collect();
    digits.parse().ok()
}
