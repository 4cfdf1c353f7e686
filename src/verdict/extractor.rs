/// Result extraction
///
/// Turns an `ExecutionOutcome` into an `EvaluationResult`. The outcome is a pure
/// input: the same outcome always yields the same status, score and reason.
///
/// A score line is a single stdout line holding a JSON object with a numeric
/// `score` and, optionally, a `metrics` array of numbers. When several lines
/// qualify, the last one wins. The scan runs over the stream while it is
/// drained, so a score printed after the retained head still counts.
use crate::exec::harness::{ExecutionOutcome, Termination};
use crate::verdict::result::{EvaluationResult, FailureReason, RunEvidence};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Extractor limits configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorLimits {
    /// Lines kept per stream in the diagnostic tail
    pub tail_lines: usize,
    /// Byte budget for the whole diagnostic tail
    pub tail_bytes: usize,
    /// Lines longer than this are skipped by the score scan
    pub max_line_bytes: usize,
}

impl Default for ExtractorLimits {
    fn default() -> Self {
        Self {
            tail_lines: 20,
            tail_bytes: 4096,
            max_line_bytes: 64 * 1024,
        }
    }
}

/// A qualifying score line
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoreRecord {
    pub score: f64,
    #[serde(default)]
    pub metrics: Option<Vec<f64>>,
}

/// Incremental last-match-wins scanner.
///
/// Holds at most one partial line and the best record so far, so feeding the
/// same bytes in any chunking gives the same answer.
pub struct ScoreScanner {
    partial: Vec<u8>,
    overflowed: bool,
    max_line_bytes: usize,
    best: Option<ScoreRecord>,
}

impl ScoreScanner {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            partial: Vec::new(),
            overflowed: false,
            max_line_bytes,
            best: None,
        }
    }

    pub fn feed(&mut self, mut chunk: &[u8]) {
        while let Some(pos) = chunk.iter().position(|b| *b == b'\n') {
            self.append(&chunk[..pos]);
            self.end_line();
            chunk = &chunk[pos + 1..];
        }
        self.append(chunk);
    }

    /// Flush the unterminated last line and return the winner
    pub fn finish(mut self) -> Option<ScoreRecord> {
        if !self.partial.is_empty() || self.overflowed {
            self.end_line();
        }
        self.best
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.partial.len() + bytes.len() > self.max_line_bytes {
            self.overflowed = true;
            self.partial.clear();
            return;
        }
        self.partial.extend_from_slice(bytes);
    }

    fn end_line(&mut self) {
        if !self.overflowed {
            if let Some(record) = parse_score_line(&self.partial) {
                self.best = Some(record);
            }
        }
        self.partial.clear();
        self.overflowed = false;
    }
}

/// One line, parsed on its own. Anything but a JSON object with a numeric score is noise.
pub fn parse_score_line(line: &[u8]) -> Option<ScoreRecord> {
    let trimmed = trim_ascii_whitespace(line);
    if trimmed.first() != Some(&b'{') {
        return None;
    }
    serde_json::from_slice::<ScoreRecord>(trimmed)
        .ok()
        .filter(|record| record.score.is_finite())
}

fn trim_ascii_whitespace(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

pub struct ResultExtractor {
    limits: ExtractorLimits,
}

impl ResultExtractor {
    pub fn new(limits: ExtractorLimits) -> Self {
        Self { limits }
    }

    /// Precedence: timeout, then non-zero exit, then missing score.
    /// A non-zero exit discards any score the process printed.
    pub fn extract(&self, outcome: &ExecutionOutcome) -> EvaluationResult {
        let evidence = RunEvidence {
            diagnostic_tail: diagnostic_tail(&outcome.stdout, &outcome.stderr, &self.limits),
            entry_fingerprint: Some(outcome.entry_fingerprint.clone()),
            wall_time_ms: Some(outcome.wall_time.as_millis() as u64),
        };

        match outcome.termination {
            Termination::TimedOut => {
                return EvaluationResult::failed(
                    FailureReason::Timeout,
                    format!(
                        "exceeded wall-clock limit, killed after {}ms",
                        outcome.wall_time.as_millis()
                    ),
                    evidence,
                );
            }
            Termination::Signaled(sig) => {
                return EvaluationResult::failed(
                    FailureReason::NonZeroExit,
                    format!("killed by signal {} (exit code {})", sig, 128 + sig),
                    evidence,
                );
            }
            Termination::Exited(code) if code != 0 => {
                return EvaluationResult::failed(
                    FailureReason::NonZeroExit,
                    format!("process exited with code {}", code),
                    evidence,
                );
            }
            Termination::Exited(_) => {}
        }

        match outcome.stdout_score.clone() {
            Some(record) => EvaluationResult::succeeded(record.score, record.metrics, evidence),
            None if outcome.stdout_truncated => EvaluationResult::failed(
                FailureReason::OutputTruncatedNoScore,
                "stdout exceeded its ceiling and no score line was seen",
                evidence,
            ),
            None => EvaluationResult::failed(
                FailureReason::NoScoreFound,
                "no JSON line with a numeric score on stdout",
                evidence,
            ),
        }
    }
}

/// Last lines of each stream, each section held to half the byte budget
pub fn diagnostic_tail(stdout: &[u8], stderr: &[u8], limits: &ExtractorLimits) -> String {
    let budget = limits.tail_bytes / 2;
    let mut out = String::new();

    for (label, bytes) in [("stdout", stdout), ("stderr", stderr)] {
        if bytes.is_empty() || limits.tail_lines == 0 {
            continue;
        }
        let section = last_lines(&String::from_utf8_lossy(bytes), limits.tail_lines);
        let section = keep_last_bytes(&section, budget);
        if section.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("--- ");
        out.push_str(label);
        out.push_str(" ---\n");
        out.push_str(section);
    }

    out
}

fn last_lines(text: &str, count: usize) -> String {
    let mut ring: VecDeque<&str> = VecDeque::with_capacity(count);
    for line in text.lines() {
        if ring.len() == count {
            ring.pop_front();
        }
        ring.push_back(line);
    }
    ring.into_iter().collect::<Vec<_>>().join("\n")
}

fn keep_last_bytes(text: &str, budget: usize) -> &str {
    if text.len() <= budget {
        return text;
    }
    let mut start = text.len() - budget;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
