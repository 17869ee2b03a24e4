use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Tag carried by spans that touch a stored data key.
pub const DATA_KEY_TAG: &str = "data_key";

/// Unique identifier for a trace (W3C Trace Context compatible, 128-bit).
///
/// Serialized as a lower-case hex string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TraceId(pub [u8; 16]);

impl TraceId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for TraceId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<16>(s).map(Self)
    }
}

impl From<TraceId> for String {
    fn from(id: TraceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for TraceId {
    type Error = IdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Unique identifier for a span within a trace (64-bit).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SpanId(pub [u8; 8]);

impl SpanId {
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for SpanId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<8>(s).map(Self)
    }
}

impl From<SpanId> for String {
    fn from(id: SpanId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SpanId {
    type Error = IdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {expected}-byte hex identifier: {input:?}")]
pub struct IdParseError {
    expected: usize,
    input: String,
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], IdParseError> {
    let err = || IdParseError {
        expected: N,
        input: s.to_string(),
    };
    let bytes = hex::decode(s).map_err(|_| err())?;
    bytes.try_into().map_err(|_| err())
}

/// One node of a span tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: SpanId,
    pub name: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub children: Vec<Span>,
}

impl Span {
    /// Depth-first walk over this span and all of its descendants.
    pub fn walk(&self) -> SpanWalk<'_> {
        SpanWalk { stack: vec![self] }
    }
}

pub struct SpanWalk<'a> {
    stack: Vec<&'a Span>,
}

impl<'a> Iterator for SpanWalk<'a> {
    type Item = &'a Span;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.stack.pop()?;
        self.stack.extend(span.children.iter().rev());
        Some(span)
    }
}

/// A complete trace as handed over by the tracing collector. Immutable once
/// created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: TraceId,
    pub root: Span,
    pub start_time: SystemTime,
    pub duration: Duration,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl TraceRecord {
    /// Data keys referenced by any span of the trace, in walk order.
    pub fn data_keys(&self) -> Vec<&str> {
        self.root
            .walk()
            .filter_map(|span| span.tags.get(DATA_KEY_TAG).map(String::as_str))
            .collect()
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }
}
