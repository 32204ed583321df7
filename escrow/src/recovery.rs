//! Startup recovery.
//!
//! A record still PENDING at startup means the process died mid-transaction.
//! Every protocol places value in the ledger before it attempts final
//! delivery, and nothing before that point removes value without escrowing
//! it, so such value is either back in the ledger or was never taken from the
//! wallet. Recovery therefore only relabels the record; it never touches the
//! ledger. The exception is a record a failed compensation left behind: it
//! already names the value at risk and is surfaced for manual review.

use crate::journal::{LogError, LogResult, TransactionLog};
use crate::record::{TransactionRecord, TransactionStatus, Transition};

/// Records relabeled by one recovery pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// The records as they are after relabeling.
    pub recovered: Vec<TransactionRecord>,
}

impl RecoveryReport {
    /// Number of relabeled records.
    pub fn len(&self) -> usize {
        self.recovered.len()
    }

    /// Returns `true` if nothing was pending.
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty()
    }
}

/// Relabels every PENDING record as RECOVERED_TO_LEDGER.
///
/// A record that already carries a detail was left pending by a failed
/// compensation; its note and escrowed value are kept as written and the
/// record is logged at error level, since its value may be in neither the
/// wallet nor the ledger.
pub fn recover_pending(log: &dyn TransactionLog) -> LogResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for record in log.pending()? {
        let flagged = record.detail.is_some();
        let mut transition = Transition::to(TransactionStatus::RecoveredToLedger);
        if !flagged {
            transition = transition.detail("found pending at startup; value is in the ledger or was never removed");
        }
        match log.transition(&record.key, transition) {
            Ok(updated) if flagged => {
                tracing::error!(
                    key = %updated.key,
                    identity = %updated.identity,
                    kind = %updated.kind,
                    at_risk = updated.escrowed_value,
                    detail = updated.detail.as_deref().unwrap_or_default(),
                    "recovered transaction whose compensation failed; value needs manual review"
                );
                report.recovered.push(updated);
            }
            Ok(updated) => {
                tracing::warn!(
                    key = %updated.key,
                    identity = %updated.identity,
                    kind = %updated.kind,
                    escrowed = updated.escrowed_value,
                    created_at = %updated.created_at,
                    "recovered interrupted transaction"
                );
                report.recovered.push(updated);
            }
            // Finished concurrently; nothing to recover.
            Err(LogError::AlreadyTerminal { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    if !report.is_empty() {
        tracing::warn!(count = report.len(), "transaction recovery relabeled pending records");
    }
    Ok(report)
}
