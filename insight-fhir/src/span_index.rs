//! Exact-span lookup from adverse-event attributes to medication records.

use std::collections::HashMap;

use insight_core::Span;

/// Write side, filled while medications are processed.
#[derive(Debug, Default)]
pub struct SpanIndexBuilder {
    entries: HashMap<Span, Vec<usize>>,
}

impl SpanIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the medication at `record` was seen at `span`.
    pub fn record(&mut self, span: Span, record: usize) {
        self.entries.entry(span).or_default().push(record);
    }

    pub fn freeze(self) -> SpanIndex {
        SpanIndex {
            entries: self.entries,
        }
    }
}

/// Read side; only exact `(begin, end)` equality matches.
#[derive(Debug, Default)]
pub struct SpanIndex {
    entries: HashMap<Span, Vec<usize>>,
}

impl SpanIndex {
    pub fn lookup(&self, span: Span) -> &[usize] {
        self.entries.get(&span).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First medication recorded at `span`.
    pub fn first(&self, span: Span) -> Option<usize> {
        self.lookup(span).first().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
