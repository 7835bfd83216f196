//! Frame reject budget for a single transfer.

use crate::error::{AbortReason, TransferError};
use tracing::{debug, warn};

/// Default number of consecutive rejects tolerated before aborting
pub const DEFAULT_MAX_CONSECUTIVE_REJECTS: u32 = 10;

/// Tracks frame rejects for one transfer session
#[derive(Debug, Clone)]
pub struct RejectBudget {
    /// Consecutive rejects tolerated; one more aborts
    limit: u32,
    /// Rejects since the last accepted frame
    consecutive: u32,
    /// Rejects over the whole transfer
    total: u32,
}

impl RejectBudget {
    /// Create a budget allowing `limit` consecutive rejects
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
            total: 0,
        }
    }

    /// Record a rejected frame; fails once the budget is exceeded
    pub fn record_reject(&mut self, chunk_index: i16, frame_index: usize) -> Result<u32, TransferError> {
        self.consecutive += 1;
        self.total += 1;

        if self.consecutive > self.limit {
            warn!(
                chunk = chunk_index,
                frame = frame_index,
                rejects = self.consecutive,
                "Frame rejected too many times in a row, aborting"
            );
            return Err(TransferError::Aborted(AbortReason::RejectBudgetExhausted {
                chunk_index,
                frame_index,
                rejects: self.consecutive,
            }));
        }

        debug!(
            chunk = chunk_index,
            frame = frame_index,
            rejects = self.consecutive,
            limit = self.limit,
            "Frame rejected, resending"
        );
        Ok(self.consecutive)
    }

    /// Record an accepted frame (clears the consecutive count)
    pub fn record_accept(&mut self) {
        self.consecutive = 0;
    }

    /// Clear all counters for a new transfer
    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.total = 0;
    }

    /// Rejects since the last accepted frame
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Rejects over the whole transfer
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Configured limit
    pub fn limit(&self) -> u32 {
        self.limit
    }
}

impl Default for RejectBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONSECUTIVE_REJECTS)
    }
}
