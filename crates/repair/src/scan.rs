//! Bounded streaming scan for oversized page-tree nodes
//!
//! The scanner reads the raw file forward once, `window_bytes` at a time,
//! and never backtracks. A small state machine recognises `/Kids [ ... ]`
//! arrays (counting `N G R` references) and `/Count N` entries; tokens that
//! straddle window boundaries are carried in the state, not in the buffer.
//! Object streams hide both tokens, so a clean pass over a file without any
//! visible `/Kids` is reported as inconclusive rather than healthy.

use crate::{RepairConfig, RepairError};
use quire_watchdog::CancellationToken;
use regex::RegexSet;
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use tracing::debug;

/// Which indicator fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversizeReason {
    /// A `/Kids` array held more references than the fan-out threshold
    FanOut { kids: usize },
    /// A `/Count` exceeded the page-count threshold
    PageCount { count: u64 },
}

impl fmt::Display for OversizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FanOut { kids } => write!(f, "page-tree node with more than {kids} kids"),
            Self::PageCount { count } => write!(f, "declared page count {count}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Healthy,
    Oversized(OversizeReason),
    /// The scan ran out of budget or never saw a page tree
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub verdict: ScanVerdict,
    pub bytes_scanned: u64,
    /// Largest `/Kids` array seen so far
    pub max_kids: usize,
    /// Largest `/Count` seen so far
    pub max_count: u64,
    /// Whether the whole document was read
    pub complete: bool,
}

impl ScanReport {
    pub fn is_oversized(&self) -> bool {
        matches!(self.verdict, ScanVerdict::Oversized(_))
    }
}

/// Why a document should be rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTrigger {
    Oversized(OversizeReason),
    /// Inconclusive scan, but size or name match a known-problematic pattern
    Suspect,
}

impl fmt::Display for RepairTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversized(reason) => reason.fmt(f),
            Self::Suspect => f.write_str("suspect source after inconclusive scan"),
        }
    }
}

/// Size and name heuristics for inconclusive scans
#[derive(Debug, Clone)]
pub struct SuspectMatcher {
    patterns: RegexSet,
    min_bytes: u64,
}

impl SuspectMatcher {
    pub fn new(config: &RepairConfig) -> Result<Self, RepairError> {
        Ok(Self {
            patterns: RegexSet::new(&config.suspect_patterns)?,
            min_bytes: config.suspect_min_bytes,
        })
    }

    pub fn is_suspect(&self, name: &str, size: Option<u64>) -> bool {
        size.is_some_and(|size| size >= self.min_bytes) || self.patterns.is_match(name)
    }
}

/// Decide whether a scanned document needs a rebuild
pub fn repair_trigger(
    report: &ScanReport,
    name: &str,
    size: Option<u64>,
    matcher: &SuspectMatcher,
) -> Option<RepairTrigger> {
    match report.verdict {
        ScanVerdict::Oversized(reason) => Some(RepairTrigger::Oversized(reason)),
        ScanVerdict::Inconclusive if matcher.is_suspect(name, size) => Some(RepairTrigger::Suspect),
        ScanVerdict::Inconclusive | ScanVerdict::Healthy => None,
    }
}

/// Scan at most `min(max_scan_bytes, declared_size)` bytes of `reader`
pub fn scan<R: Read>(
    mut reader: R,
    declared_size: Option<u64>,
    config: &RepairConfig,
    token: &CancellationToken,
) -> Result<ScanReport, RepairError> {
    let limit = declared_size.map_or(config.max_scan_bytes, |size| size.min(config.max_scan_bytes));
    let mut window = vec![0u8; config.window_bytes.max(1)];
    let mut scanner = Scanner::new(config.kids_threshold, config.count_threshold);
    let mut scanned = 0u64;
    let mut exhausted = false;

    while scanned < limit {
        token.check()?;
        let want = (limit - scanned).min(window.len() as u64) as usize;
        let read = match reader.read(&mut window[..want]) {
            Ok(0) => {
                exhausted = true;
                break;
            }
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        scanned += read as u64;

        if let Some(reason) = scanner.feed(&window[..read]) {
            debug!(bytes = scanned, %reason, "page-tree scan flagged document");
            return Ok(scanner.report(ScanVerdict::Oversized(reason), scanned, false));
        }
    }

    if let Some(reason) = scanner.finish() {
        return Ok(scanner.report(ScanVerdict::Oversized(reason), scanned, true));
    }

    let complete = exhausted || declared_size.is_some_and(|size| scanned >= size);
    let verdict = if complete && scanner.kids_seen {
        ScanVerdict::Healthy
    } else {
        ScanVerdict::Inconclusive
    };
    debug!(bytes = scanned, complete, ?verdict, "page-tree scan finished");
    Ok(scanner.report(verdict, scanned, complete))
}

pub fn scan_path(
    path: &Path,
    config: &RepairConfig,
    token: &CancellationToken,
) -> Result<ScanReport, RepairError> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    scan(file, Some(size), config, token)
}

#[derive(Debug, Clone, Copy)]
enum State {
    Idle,
    Name { buf: [u8; 8], len: usize },
    AfterKids,
    InKids { refs: usize, prev_ws: bool, pending_ref: bool },
    AfterCount { value: u64, digits: usize },
}

struct Scanner {
    state: State,
    kids_threshold: usize,
    count_threshold: u64,
    kids_seen: bool,
    max_kids: usize,
    max_count: u64,
}

impl Scanner {
    fn new(kids_threshold: usize, count_threshold: u64) -> Self {
        Self {
            state: State::Idle,
            kids_threshold,
            count_threshold,
            kids_seen: false,
            max_kids: 0,
            max_count: 0,
        }
    }

    fn report(&self, verdict: ScanVerdict, bytes_scanned: u64, complete: bool) -> ScanReport {
        ScanReport {
            verdict,
            bytes_scanned,
            max_kids: self.max_kids,
            max_count: self.max_count,
            complete,
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Option<OversizeReason> {
        bytes.iter().find_map(|&byte| self.step(byte))
    }

    /// Flush a `/Count` that ended exactly at end of input
    fn finish(&mut self) -> Option<OversizeReason> {
        match self.state {
            State::AfterCount { value, digits } if digits > 0 => {
                self.state = State::Idle;
                self.record_count(value)
            }
            _ => None,
        }
    }

    fn step(&mut self, byte: u8) -> Option<OversizeReason> {
        // A token ending on `byte` hands it to the next state, hence the loop
        loop {
            match self.state {
                State::Idle => {
                    if byte == b'/' {
                        self.state = State::Name {
                            buf: [0; 8],
                            len: 0,
                        };
                    }
                    return None;
                }
                State::Name { mut buf, len } => {
                    if is_regular(byte) {
                        if len < buf.len() {
                            buf[len] = byte;
                        }
                        self.state = State::Name {
                            buf,
                            len: len.saturating_add(1),
                        };
                        return None;
                    }
                    self.state = match &buf[..len.min(buf.len())] {
                        b"Kids" if len == 4 => State::AfterKids,
                        b"Count" if len == 5 => State::AfterCount {
                            value: 0,
                            digits: 0,
                        },
                        _ => State::Idle,
                    };
                }
                State::AfterKids => {
                    if is_whitespace(byte) {
                        return None;
                    }
                    if byte == b'[' {
                        self.kids_seen = true;
                        self.state = State::InKids {
                            refs: 0,
                            prev_ws: true,
                            pending_ref: false,
                        };
                        return None;
                    }
                    // Indirect arrays are not followed
                    self.state = State::Idle;
                }
                State::InKids {
                    mut refs,
                    prev_ws,
                    pending_ref,
                } => {
                    if pending_ref && (is_whitespace(byte) || is_delimiter(byte)) {
                        refs += 1;
                        self.max_kids = self.max_kids.max(refs);
                        if refs > self.kids_threshold {
                            self.state = State::Idle;
                            return Some(OversizeReason::FanOut { kids: refs });
                        }
                    }
                    self.state = if byte == b']' {
                        State::Idle
                    } else {
                        State::InKids {
                            refs,
                            prev_ws: is_whitespace(byte),
                            pending_ref: byte == b'R' && prev_ws,
                        }
                    };
                    return None;
                }
                State::AfterCount { value, digits } => {
                    if byte.is_ascii_digit() {
                        self.state = State::AfterCount {
                            value: value
                                .saturating_mul(10)
                                .saturating_add(u64::from(byte - b'0')),
                            digits: digits + 1,
                        };
                        return None;
                    }
                    if digits == 0 && is_whitespace(byte) {
                        return None;
                    }
                    self.state = State::Idle;
                    if digits > 0 {
                        if let Some(reason) = self.record_count(value) {
                            return Some(reason);
                        }
                    }
                }
            }
        }
    }

    fn record_count(&mut self, value: u64) -> Option<OversizeReason> {
        self.max_count = self.max_count.max(value);
        (value > self.count_threshold).then_some(OversizeReason::PageCount { count: value })
    }
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n' | 0x0c | 0x00)
}

fn is_delimiter(byte: u8) -> bool {
    matches!(
        byte,
        b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%'
    )
}

fn is_regular(byte: u8) -> bool {
    !is_whitespace(byte) && !is_delimiter(byte)
}
