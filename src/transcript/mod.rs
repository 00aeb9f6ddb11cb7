//! Pattern-driven scanning of live terminal output.
//!
//! A [`Transcript`] accumulates decoded text from a process output stream and
//! waits for the first of several candidate [`Pattern`]s to appear. Text that
//! follows a match stays buffered so the next wait starts where the previous
//! one stopped, which is how an operator reads a terminal.

use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, timeout_at};

/// Receiving half of a process output channel.
pub type OutputStream = UnboundedReceiver<Vec<u8>>;

/// Default cap on buffered text before the oldest output is discarded.
pub const DEFAULT_BUFFER_LIMIT: usize = 64 * 1024;

const TAIL_CHARS: usize = 240;

/// Candidate text to wait for.
#[derive(Clone, Debug)]
pub enum Pattern {
    /// Exact text.
    Literal(String),
    /// Regular expression; capture groups are reported on match.
    Regex(Regex),
}

impl Pattern {
    /// Builds a literal pattern.
    #[must_use]
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    /// Compiles a regular expression pattern.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::InvalidPattern`] when the expression does not
    /// compile.
    pub fn regex(expression: &str) -> Result<Self, MatchError> {
        Regex::new(expression)
            .map(Self::Regex)
            .map_err(|err| MatchError::InvalidPattern {
                pattern: expression.to_owned(),
                message: err.to_string(),
            })
    }

    fn find(&self, haystack: &str) -> Option<Found> {
        match self {
            Self::Literal(text) => haystack.find(text.as_str()).map(|start| Found {
                start,
                end: start + text.len(),
                captures: Vec::new(),
            }),
            Self::Regex(regex) => {
                let captures = regex.captures(haystack)?;
                let whole = captures.get(0)?;
                Some(Found {
                    start: whole.start(),
                    end: whole.end(),
                    captures: captures
                        .iter()
                        .skip(1)
                        .map(|group| group.map(|m| m.as_str().to_owned()))
                        .collect(),
                })
            }
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(text) => write!(f, "{text:?}"),
            Self::Regex(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

struct Found {
    start: usize,
    end: usize,
    captures: Vec<Option<String>>,
}

/// Result of a successful wait.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Match {
    /// Position of the matching pattern in the candidate list.
    pub index: usize,
    /// Text received before the match.
    pub before: String,
    /// The matched text itself.
    pub matched: String,
    /// Capture groups of a regular expression match, group 1 first.
    pub captures: Vec<Option<String>>,
}

impl Match {
    /// Returns capture group `group`, counting from 1 like regex syntax.
    #[must_use]
    pub fn capture(&self, group: usize) -> Option<&str> {
        group
            .checked_sub(1)
            .and_then(|slot| self.captures.get(slot))
            .and_then(Option::as_deref)
    }
}

/// Errors raised while waiting on output.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MatchError {
    /// A regular expression failed to compile.
    #[error("invalid pattern {pattern:?}: {message}")]
    InvalidPattern {
        /// Source text of the expression.
        pattern: String,
        /// Compiler diagnostic.
        message: String,
    },
    /// Nothing matched within the wait bound.
    #[error("timed out after {waited:?} waiting for {patterns}")]
    Timeout {
        /// Rendered candidate list.
        patterns: String,
        /// How long the wait lasted.
        waited: Duration,
        /// Most recent unmatched output.
        tail: String,
    },
    /// The process closed its output before anything matched.
    #[error("output ended while waiting for {patterns}")]
    StreamClosed {
        /// Rendered candidate list.
        patterns: String,
        /// Most recent unmatched output.
        tail: String,
    },
}

/// Buffered view over a process output stream.
#[derive(Debug)]
pub struct Transcript {
    stream: OutputStream,
    buffer: String,
    pending: Vec<u8>,
    limit: usize,
    echo: bool,
    closed: bool,
}

impl Transcript {
    /// Wraps `stream` with an empty buffer.
    #[must_use]
    pub const fn new(stream: OutputStream) -> Self {
        Self {
            stream,
            buffer: String::new(),
            pending: Vec::new(),
            limit: DEFAULT_BUFFER_LIMIT,
            echo: false,
            closed: false,
        }
    }

    /// Copies every received chunk to standard error when `echo` is set.
    #[must_use]
    pub const fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Overrides the buffer cap.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Text received but not yet consumed by a match.
    #[must_use]
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Returns `true` once the underlying stream has ended.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// The last few hundred characters of unconsumed output.
    #[must_use]
    pub fn tail(&self) -> String {
        let skip = self.buffer.chars().count().saturating_sub(TAIL_CHARS);
        self.buffer.chars().skip(skip).collect()
    }

    /// Waits until one of `patterns` appears in the output.
    ///
    /// The match starting earliest in the buffer wins; at equal start
    /// positions the earlier candidate wins. `wait` of `None` waits for as
    /// long as the stream stays open.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::Timeout`] when the bound elapses and
    /// [`MatchError::StreamClosed`] when the stream ends without a match.
    pub async fn expect(
        &mut self,
        patterns: &[Pattern],
        wait: Option<Duration>,
    ) -> Result<Match, MatchError> {
        let started = Instant::now();
        let deadline = wait.map(|bound| started + bound);
        loop {
            if let Some(found) = self.scan(patterns) {
                return Ok(found);
            }
            if self.closed {
                return Err(MatchError::StreamClosed {
                    patterns: describe(patterns),
                    tail: self.tail(),
                });
            }

            let chunk = match deadline {
                Some(deadline) => match timeout_at(deadline, self.stream.recv()).await {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        return Err(MatchError::Timeout {
                            patterns: describe(patterns),
                            waited: started.elapsed(),
                            tail: self.tail(),
                        });
                    }
                },
                None => self.stream.recv().await,
            };

            match chunk {
                Some(bytes) => self.ingest(&bytes),
                None => self.finish(),
            }
        }
    }

    fn scan(&mut self, patterns: &[Pattern]) -> Option<Match> {
        let (index, found) = patterns
            .iter()
            .enumerate()
            .filter_map(|(index, pattern)| pattern.find(&self.buffer).map(|found| (index, found)))
            .min_by_key(|(index, found)| (found.start, *index))?;

        let before = self.buffer.get(..found.start)?.to_owned();
        let matched = self.buffer.get(found.start..found.end)?.to_owned();
        self.buffer.drain(..found.end);

        Some(Match {
            index,
            before,
            matched,
            captures: found.captures,
        })
    }

    fn ingest(&mut self, bytes: &[u8]) {
        if self.echo {
            let mut stderr = io::stderr();
            stderr.write_all(bytes).ok();
            stderr.flush().ok();
        }
        self.pending.extend_from_slice(bytes);
        self.decode_pending();
        self.enforce_limit();
    }

    fn finish(&mut self) {
        if !self.pending.is_empty() {
            self.buffer
                .push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
        self.closed = true;
    }

    // Leaves an incomplete trailing sequence in `pending` for the next chunk.
    fn decode_pending(&mut self) {
        loop {
            let error = match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(error) => error,
            };

            let valid = error.valid_up_to();
            let (head, _) = self.pending.split_at(valid);
            self.buffer
                .push_str(std::str::from_utf8(head).unwrap_or_default());

            let Some(invalid) = error.error_len() else {
                self.pending.drain(..valid);
                return;
            };
            self.buffer.push(char::REPLACEMENT_CHARACTER);
            self.pending.drain(..valid + invalid);
        }
    }

    fn enforce_limit(&mut self) {
        if self.buffer.len() <= self.limit {
            return;
        }
        let mut cut = self.buffer.len() - self.limit;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }
}

/// Renders a candidate list for error messages.
#[must_use]
pub fn describe(patterns: &[Pattern]) -> String {
    patterns
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests;
