//! Bounded in-memory log history of a job.
//!
//! Lines are kept twice: a plain recency window for first-touch catch-up and
//! a sequence-numbered window for resuming from an offset. Both hold the same
//! lines and drop the oldest once `capacity` is reached. Sequence numbers
//! start at 1 and are never reused, so an offset stays meaningful after
//! eviction; a caller whose offset fell out of the window gets
//! [`Replay::Evicted`] and has to read the persisted log instead.

use std::collections::VecDeque;

/// Result of asking for the lines after a sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replay {
    /// retained lines after the offset, oldest first
    Lines(Vec<(u64, String)>),
    /// caught up, nothing newer than the offset yet
    UpToDate,
    /// the line following the offset was already dropped
    Evicted { last_seq: u64 },
    /// nothing was ever buffered for this job
    Empty,
}

#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    recent: VecDeque<String>,
    numbered: VecDeque<(u64, String)>,
    last_seq: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity),
            numbered: VecDeque::with_capacity(capacity),
            last_seq: 0,
        }
    }

    /// append a line, returns its sequence number
    pub fn push(&mut self, line: String) -> u64 {
        self.last_seq += 1;
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        if self.numbered.len() == self.capacity {
            self.numbered.pop_front();
        }
        self.recent.push_back(line.clone());
        self.numbered.push_back((self.last_seq, line));
        self.last_seq
    }

    pub fn recent(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.numbered.front().map(|(seq, _)| *seq)
    }

    pub fn since(&self, since: u64, limit: usize) -> Replay {
        let first = match self.first_seq() {
            Some(first) => first,
            None => return Replay::Empty,
        };
        if since.saturating_add(1) < first {
            return Replay::Evicted {
                last_seq: self.last_seq,
            };
        }
        if since >= self.last_seq {
            return Replay::UpToDate;
        }
        // retained sequence numbers are contiguous, index straight to the offset
        let skip = (since + 1 - first) as usize;
        let entries: Vec<(u64, String)> = self
            .numbered
            .iter()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect();
        if entries.is_empty() {
            Replay::UpToDate
        } else {
            Replay::Lines(entries)
        }
    }
}
