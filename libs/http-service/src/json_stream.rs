//! Incremental JSON scanning with path filters.
//!
//! The scanner consumes a JSON document in arbitrary chunks and emits every
//! value whose path matches a [`StreamFilter`], without materialising the rest
//! of the document. Matched values are parsed with `serde_json` once their
//! last byte has arrived.

use crate::error::ConfigError;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// `*`: any key or index
    Any,
    /// an object key, or an array index written in decimal
    Literal(String),
}

/// A dot-separated path expression such as `*`, `rows.*` or `data.0.name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFilter {
    segments: Vec<Segment>,
}

impl StreamFilter {
    /// Number of container levels between the root and a matched value.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    fn matches(&self, path: &[PathItem<'_>]) -> bool {
        path.len() == self.segments.len()
            && self
                .segments
                .iter()
                .zip(path)
                .all(|(segment, item)| match (segment, item) {
                    (Segment::Any, _) => true,
                    (Segment::Literal(lit), PathItem::Key(key)) => lit == key,
                    (Segment::Literal(lit), PathItem::Index(index)) => {
                        lit.parse::<usize>().is_ok_and(|i| i == *index)
                    }
                })
    }
}

impl FromStr for StreamFilter {
    type Err = ConfigError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ConfigError::MissingStreamFilter);
        }
        let segments = expr
            .split('.')
            .map(|part| match part {
                "" => Err(ConfigError::InvalidStreamFilter(expr.to_owned())),
                "*" => Ok(Segment::Any),
                lit => Ok(Segment::Literal(lit.to_owned())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }
}

impl fmt::Display for StreamFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                Segment::Any => f.write_str("*")?,
                Segment::Literal(lit) => f.write_str(lit)?,
            }
        }
        Ok(())
    }
}

enum PathItem<'a> {
    Key(&'a str),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectState {
    KeyOrEnd,
    Key,
    Colon,
    Value,
    CommaOrEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayState {
    ValueOrEnd,
    Value,
    CommaOrEnd,
}

#[derive(Debug)]
enum Container {
    Object { key: String, state: ObjectState },
    Array { index: usize, state: ArrayState },
}

#[derive(Debug, Clone, Copy)]
struct Capture {
    start: usize,
    depth: usize,
}

/// Why a stream could not be decoded, with the text around the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanError {
    pub reason: String,
    pub near: String,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} near '{}'", self.reason, self.near)
    }
}

enum Step {
    Progress,
    NeedMore,
}

/// Push-style scanner: feed chunks in, collect matched values.
#[derive(Debug)]
pub struct JsonScanner {
    filter: StreamFilter,
    buf: Vec<u8>,
    pos: usize,
    stack: Vec<Container>,
    capture: Option<Capture>,
    eof: bool,
}

impl JsonScanner {
    #[must_use]
    pub fn new(filter: StreamFilter) -> Self {
        Self {
            filter,
            buf: Vec::new(),
            pos: 0,
            stack: Vec::new(),
            capture: None,
            eof: false,
        }
    }

    /// Consumes a chunk and appends every completed match to `out`.
    ///
    /// # Errors
    /// Returns a [`ScanError`] on malformed input.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        out: &mut VecDeque<serde_json::Value>,
    ) -> Result<(), ScanError> {
        self.buf.extend_from_slice(chunk);
        self.run(out)?;
        self.compact();
        Ok(())
    }

    /// Signals end of input; fails if a document was left unfinished.
    ///
    /// # Errors
    /// Returns a [`ScanError`] on malformed or truncated input.
    pub fn finish(&mut self, out: &mut VecDeque<serde_json::Value>) -> Result<(), ScanError> {
        self.eof = true;
        self.run(out)?;
        if !self.stack.is_empty() || self.pos < self.buf.len() {
            return Err(self.error("unexpected end of input"));
        }
        Ok(())
    }

    fn run(&mut self, out: &mut VecDeque<serde_json::Value>) -> Result<(), ScanError> {
        loop {
            while self.pos < self.buf.len() && self.buf[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.pos >= self.buf.len() {
                return Ok(());
            }
            if let Step::NeedMore = self.step(out)? {
                return Ok(());
            }
        }
    }

    fn step(&mut self, out: &mut VecDeque<serde_json::Value>) -> Result<Step, ScanError> {
        let byte = self.buf[self.pos];
        match self.stack.last_mut() {
            None => self.begin_value(out),
            Some(Container::Array { state, index }) => match (*state, byte) {
                (ArrayState::ValueOrEnd | ArrayState::CommaOrEnd, b']') => {
                    self.pos += 1;
                    self.close_container(out)
                }
                (ArrayState::CommaOrEnd, b',') => {
                    *index += 1;
                    *state = ArrayState::Value;
                    self.pos += 1;
                    Ok(Step::Progress)
                }
                (ArrayState::ValueOrEnd | ArrayState::Value, _) => self.begin_value(out),
                (ArrayState::CommaOrEnd, _) => Err(self.error("expected ',' or ']'")),
            },
            Some(Container::Object { state, .. }) => match (*state, byte) {
                (ObjectState::KeyOrEnd | ObjectState::CommaOrEnd, b'}') => {
                    self.pos += 1;
                    self.close_container(out)
                }
                (ObjectState::KeyOrEnd | ObjectState::Key, b'"') => self.read_key(),
                (ObjectState::Colon, b':') => {
                    *state = ObjectState::Value;
                    self.pos += 1;
                    Ok(Step::Progress)
                }
                (ObjectState::CommaOrEnd, b',') => {
                    *state = ObjectState::Key;
                    self.pos += 1;
                    Ok(Step::Progress)
                }
                (ObjectState::Value, _) => self.begin_value(out),
                (ObjectState::KeyOrEnd | ObjectState::Key, _) => {
                    Err(self.error("expected object key"))
                }
                (ObjectState::Colon, _) => Err(self.error("expected ':'")),
                (ObjectState::CommaOrEnd, _) => Err(self.error("expected ',' or '}'")),
            },
        }
    }

    fn current_path(&self) -> Vec<PathItem<'_>> {
        self.stack
            .iter()
            .map(|c| match c {
                Container::Object { key, .. } => PathItem::Key(key),
                Container::Array { index, .. } => PathItem::Index(*index),
            })
            .collect()
    }

    fn begin_value(&mut self, out: &mut VecDeque<serde_json::Value>) -> Result<Step, ScanError> {
        if self.capture.is_none()
            && self.stack.len() == self.filter.depth()
            && self.filter.matches(&self.current_path())
        {
            self.capture = Some(Capture {
                start: self.pos,
                depth: self.stack.len(),
            });
        }

        match self.buf[self.pos] {
            b'{' => {
                self.pos += 1;
                self.stack.push(Container::Object {
                    key: String::new(),
                    state: ObjectState::KeyOrEnd,
                });
                Ok(Step::Progress)
            }
            b'[' => {
                self.pos += 1;
                self.stack.push(Container::Array {
                    index: 0,
                    state: ArrayState::ValueOrEnd,
                });
                Ok(Step::Progress)
            }
            b'"' => match self.string_end() {
                Some(end) => {
                    self.pos = end;
                    self.value_done(out)
                }
                None => Ok(Step::NeedMore),
            },
            b'-' | b'0'..=b'9' => self.scalar(out, |b| b"+-.eE0123456789".contains(&b)),
            b't' | b'f' | b'n' => self.scalar(out, |b| b.is_ascii_alphabetic()),
            _ => Err(self.error("unexpected character")),
        }
    }

    fn scalar(
        &mut self,
        out: &mut VecDeque<serde_json::Value>,
        accept: impl Fn(u8) -> bool,
    ) -> Result<Step, ScanError> {
        let end = self.buf[self.pos..]
            .iter()
            .position(|&b| !accept(b))
            .map(|offset| self.pos + offset);
        match end {
            Some(end) => self.pos = end,
            None if self.eof => self.pos = self.buf.len(),
            None => return Ok(Step::NeedMore),
        }
        self.value_done(out)
    }

    /// Index one past the closing quote of the string starting at `pos`.
    fn string_end(&self) -> Option<usize> {
        let mut i = self.pos + 1;
        while i < self.buf.len() {
            match self.buf[i] {
                b'\\' => i += 2,
                b'"' => return Some(i + 1),
                _ => i += 1,
            }
        }
        None
    }

    fn read_key(&mut self) -> Result<Step, ScanError> {
        let Some(end) = self.string_end() else {
            return Ok(Step::NeedMore);
        };
        let key: String = serde_json::from_slice(&self.buf[self.pos..end])
            .map_err(|e| self.error(&format!("invalid object key: {e}")))?;
        if let Some(Container::Object { key: slot, state }) = self.stack.last_mut() {
            *slot = key;
            *state = ObjectState::Colon;
        }
        self.pos = end;
        Ok(Step::Progress)
    }

    fn close_container(&mut self, out: &mut VecDeque<serde_json::Value>) -> Result<Step, ScanError> {
        self.stack.pop();
        self.value_done(out)
    }

    fn value_done(&mut self, out: &mut VecDeque<serde_json::Value>) -> Result<Step, ScanError> {
        if let Some(capture) = self.capture
            && capture.depth == self.stack.len()
        {
            let raw = &self.buf[capture.start..self.pos];
            let value = serde_json::from_slice(raw).map_err(|e| ScanError {
                reason: e.to_string(),
                near: String::from_utf8_lossy(raw).into_owned(),
            })?;
            out.push_back(value);
            self.capture = None;
        }

        match self.stack.last_mut() {
            Some(Container::Object { state, .. }) => *state = ObjectState::CommaOrEnd,
            Some(Container::Array { state, .. }) => *state = ArrayState::CommaOrEnd,
            None => {}
        }
        Ok(Step::Progress)
    }

    /// Drops bytes that can no longer be part of an emitted value.
    fn compact(&mut self) {
        let keep_from = self.capture.map_or(self.pos, |c| c.start);
        if keep_from == 0 {
            return;
        }
        self.buf.drain(..keep_from);
        self.pos -= keep_from;
        if let Some(capture) = self.capture.as_mut() {
            capture.start -= keep_from;
        }
    }

    fn error(&self, reason: &str) -> ScanError {
        let from = self.pos.saturating_sub(32);
        let to = (self.pos + 32).min(self.buf.len());
        ScanError {
            reason: reason.to_owned(),
            near: String::from_utf8_lossy(&self.buf[from..to]).into_owned(),
        }
    }
}
