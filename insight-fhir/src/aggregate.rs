//! Dedup of mentions by cui, with a dense insight counter per cui.

use std::collections::HashMap;

use insight_core::Mention;
use tracing::debug;

use crate::builders::ResourceBuilder;
use crate::provenance::{self, InsightId, InsightRecord, ProvenanceContext};

/// Outcome of folding one mention into the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    /// Position of the owning record, stable for the life of the aggregator.
    pub index: usize,
    pub insight_id: InsightId,
    pub created: bool,
}

/// One record per cui, kept in first-seen order.
#[derive(Debug)]
pub struct Aggregator<R> {
    records: Vec<R>,
    by_cui: HashMap<String, usize>,
    counters: HashMap<String, u32>,
}

impl<R> Default for Aggregator<R> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            by_cui: HashMap::new(),
            counters: HashMap::new(),
        }
    }
}

impl<R: InsightRecord> Aggregator<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process<M, B>(
        &mut self,
        builder: &B,
        mention: &M,
        context: &ProvenanceContext,
    ) -> Processed
    where
        M: Mention + ?Sized,
        B: ResourceBuilder<M, Record = R>,
    {
        let cui = mention.cui();
        let (index, created) = match self.by_cui.get(cui) {
            Some(&index) => (index, false),
            None => {
                self.records.push(builder.create(mention));
                let index = self.records.len() - 1;
                self.by_cui.insert(cui.to_string(), index);
                (index, true)
            }
        };

        let counter = self.counters.entry(cui.to_string()).or_insert(0);
        *counter += 1;
        let insight_id = InsightId::new(*counter);

        let record = &mut self.records[index];
        builder.populate(record, mention, insight_id);
        let entry = provenance::compose(mention, insight_id, builder.confidence_kind(), context);
        provenance::attach(record, entry);

        debug!(cui = %cui, insight = %insight_id, created, "processed mention");

        Processed {
            index,
            insight_id,
            created,
        }
    }

    /// Last insight number handed out for `cui`; 0 when unseen.
    pub fn insight_count(&self, cui: &str) -> u32 {
        self.counters.get(cui).copied().unwrap_or(0)
    }

    pub fn get(&self, index: usize) -> Option<&R> {
        self.records.get(index)
    }

    pub fn find(&self, cui: &str) -> Option<&R> {
        self.by_cui.get(cui).and_then(|&index| self.records.get(index))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<R> {
        self.records
    }
}
