use serde::Serialize;
use std::collections::VecDeque;

use crate::record::Record;

/// Newest-first list of records holding at most `capacity` entries.
/// Overflow drops the oldest entry by position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct History {
    records: VecDeque<Record>,
    #[serde(skip)]
    capacity: usize,
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Rebuild from a persisted list, keeping the newest `capacity` entries.
    pub fn from_records(records: Vec<Record>, capacity: usize) -> Self {
        let mut records: VecDeque<Record> = records.into();
        records.truncate(capacity);
        Self { records, capacity }
    }

    /// Insert at the front. Returns the record evicted from the tail, if any.
    pub fn push_front(&mut self, record: Record) -> Option<Record> {
        self.records.push_front(record);
        if self.records.len() > self.capacity {
            self.records.pop_back()
        } else {
            None
        }
    }

    pub fn first(&self) -> Option<&Record> {
        self.records.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn to_vec(&self) -> Vec<Record> {
        self.records.iter().cloned().collect()
    }
}
