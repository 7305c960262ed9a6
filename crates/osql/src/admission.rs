//! Admission control: bounds a transaction by operation count.
//!
//! Runs once per logical row-level request, before any network activity.
//! A rejection is final for the transaction; counters are never rolled back.

use serde::{Deserialize, Serialize};

/// Operation counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounters {
    /// Operations sent this session, reported with the commit.
    pub sent_op_count: u64,
    /// Operations since the last commit or abort.
    pub transaction_op_count: u64,
}

/// The transaction went past its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub transaction_op_count: u64,
    pub limit: u64,
}

impl OpCounters {
    /// Counts one operation and checks it against `limit` (0 = unlimited).
    pub fn admit(&mut self, limit: u64) -> Result<(), Rejected> {
        self.sent_op_count += 1;
        self.transaction_op_count += 1;
        if limit > 0 && self.transaction_op_count > limit {
            return Err(Rejected {
                transaction_op_count: self.transaction_op_count,
                limit,
            });
        }
        Ok(())
    }

    /// Clears both counters at the end of a transaction.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
