// ── Transfer history – records of finished transfers ─────────────────

use crate::ftp::types::{HistoryStats, TransferDirection, TransferRecord, TransferStatus};
use std::collections::VecDeque;

/// Bounded log of finished jobs, oldest dropped first.
#[derive(Debug, Clone)]
pub struct TransferHistory {
    records: VecDeque<TransferRecord>,
    limit: usize,
}

impl TransferHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, record: TransferRecord) {
        self.records.push_back(record);
        // Trim to max size
        while self.records.len() > self.limit {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Newest first, at most `limit` records (all when `None`).
    pub fn recent(&self, limit: Option<usize>) -> Vec<TransferRecord> {
        self.records
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn by_direction(&self, direction: TransferDirection) -> Vec<TransferRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.direction == direction)
            .cloned()
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<TransferRecord> {
        self.records.iter().rev().find(|r| r.id == id).cloned()
    }

    /// Clear all records; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.records.len();
        self.records.clear();
        count
    }

    pub fn stats(&self) -> HistoryStats {
        let mut stats = HistoryStats {
            total: self.records.len(),
            ..HistoryStats::default()
        };
        for r in &self.records {
            match r.status {
                TransferStatus::Done => stats.done += 1,
                TransferStatus::Failed => stats.failed += 1,
                TransferStatus::Cancelled => stats.cancelled += 1,
                _ => {}
            }
            match r.direction {
                TransferDirection::Upload => {
                    stats.uploads += 1;
                    stats.bytes_uploaded += r.bytes_transferred;
                }
                TransferDirection::Download => {
                    stats.downloads += 1;
                    stats.bytes_downloaded += r.bytes_transferred;
                }
            }
        }
        stats
    }
}
