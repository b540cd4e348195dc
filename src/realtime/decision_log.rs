use crate::error::Result;
use crate::types::{Price, Symbol};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Entry,
    Exit,
    Hold,
    Skip,
}

/// One audited decision of the control loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: DecisionKind,
    pub symbol: Option<Symbol>,
    pub action: String,
    pub confidence: f64,
    pub justification: String,
    pub strategy: Option<String>,
    pub price: Option<Price>,
    pub metadata: BTreeMap<String, String>,
}

impl DecisionRecord {
    pub fn new(timestamp: DateTime<Utc>, kind: DecisionKind, justification: impl Into<String>) -> Self {
        Self {
            timestamp,
            kind,
            symbol: None,
            action: String::new(),
            confidence: 0.0,
            justification: justification.into(),
            strategy: None,
            price: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn symbol(mut self, symbol: Symbol) -> Self {
        self.symbol = Some(symbol);
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn price(mut self, price: Price) -> Self {
        self.price = Some(price);
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// Bounded append-only decision audit trail
///
/// Records not yet flushed are tracked so repeated flushes append each
/// record to the JSON-lines file exactly once.
#[derive(Debug)]
pub struct DecisionLog {
    records: VecDeque<DecisionRecord>,
    capacity: usize,
    unflushed: usize,
    total: u64,
}

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            unflushed: 0,
            total: 0,
        }
    }

    pub fn push(&mut self, record: DecisionRecord) {
        debug!(
            "Decision {:?} {} {}: {}",
            record.kind,
            record.symbol.as_ref().map(Symbol::as_str).unwrap_or("-"),
            record.action,
            record.justification
        );
        self.records.push_back(record);
        self.unflushed = (self.unflushed + 1).min(self.capacity);
        self.total += 1;
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Decisions logged since start, including evicted ones
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn records(&self) -> impl Iterator<Item = &DecisionRecord> {
        self.records.iter()
    }

    pub fn recent(&self, n: usize) -> Vec<DecisionRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// The next push would evict a record that never reached disk
    pub fn needs_flush(&self) -> bool {
        self.unflushed >= self.capacity
    }

    pub fn count(&self, kind: DecisionKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }

    /// Append unflushed records to `path` as JSON lines
    pub fn flush_to(&mut self, path: &Path) -> Result<usize> {
        if self.unflushed == 0 {
            return Ok(0);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        let start = self.records.len() - self.unflushed;
        for record in self.records.iter().skip(start) {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        let written = self.unflushed;
        self.unflushed = 0;
        info!("Flushed {} decisions to {}", written, path.display());
        Ok(written)
    }
}
