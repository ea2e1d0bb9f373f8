//! Session status projection.
//!
//! The worker owns the authoritative state and publishes it whole through
//! a watch channel after every mutation. Readers borrow the latest value,
//! so a query always observes a complete snapshot, never a half-applied
//! update, while the worker keeps running.

use tokio::sync::watch;

use super::state::{Phase, StatusSnapshot};
use crate::ledger::TokenLedger;

/// Create a projection channel seeded with `initial`.
#[must_use]
pub fn channel(initial: StatusSnapshot) -> (StatusPublisher, StatusReader) {
    let (tx, rx) = watch::channel(initial);
    (StatusPublisher { tx }, StatusReader { rx })
}

/// Write half, held by the session worker.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    /// Recompute derived fields and publish the snapshot.
    ///
    /// The amount due is derived from the ledger total here, at the single
    /// publication point, so it can never drift from the tokens it prices.
    pub fn publish(&self, snapshot: &mut StatusSnapshot) {
        snapshot.amount_due_minor = snapshot.pricing.amount_due(snapshot.tokens.total);
        self.tx.send_replace(snapshot.clone());
    }
}

/// Read half, cheap to clone, served to queries.
#[derive(Debug, Clone)]
pub struct StatusReader {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusReader {
    /// Full snapshot of the session state.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.rx.borrow().clone()
    }

    /// Total tokens consumed so far.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.rx.borrow().tokens.total
    }

    /// Token breakdown by category.
    #[must_use]
    pub fn tokens(&self) -> TokenLedger {
        self.rx.borrow().tokens
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.rx.borrow().phase
    }

    /// Wait until the session reaches a terminal phase and return that
    /// snapshot. Returns `None` only if the worker vanished without
    /// publishing a terminal state.
    pub async fn wait_terminal(&mut self) -> Option<StatusSnapshot> {
        self.rx
            .wait_for(|snapshot| snapshot.phase.is_terminal())
            .await
            .map(|snapshot| snapshot.clone())
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use crate::ledger::{ChargeCategory, Pricing};
    use crate::session::state::SessionId;

    use super::*;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot::initial(
            SessionId::generate("7"),
            "7".to_string(),
            Pricing {
                price_per_thousand: 25,
                currency: "USD".to_string(),
            },
        )
    }

    #[test]
    fn test_publish_recomputes_amount_due() {
        let (publisher, reader) = channel(snapshot());

        let mut status = reader.snapshot();
        status.tokens.credit(ChargeCategory::Unlock, 1000);
        publisher.publish(&mut status);

        assert_eq!(status.amount_due_minor, 25);
        assert_eq!(reader.snapshot().amount_due_minor, 25);
        assert_eq!(reader.total_tokens(), 1000);
    }

    #[test]
    fn test_reader_sees_latest() {
        let (publisher, reader) = channel(snapshot());
        let mut status = reader.snapshot();

        for _ in 0..3 {
            status.tokens.credit(ChargeCategory::Time, 2);
            publisher.publish(&mut status);
        }

        assert_eq!(reader.total_tokens(), 6);
        assert_eq!(reader.tokens().time, 6);
        assert!(reader.snapshot().tokens.is_balanced());
    }

    #[tokio::test]
    async fn test_wait_terminal() {
        let (publisher, reader) = channel(snapshot());
        let mut waiter = reader.clone();

        let task = tokio::spawn(async move { waiter.wait_terminal().await });

        let mut status = reader.snapshot();
        status.phase = Phase::Active;
        publisher.publish(&mut status);
        status.phase = Phase::Ended;
        publisher.publish(&mut status);

        let terminal = task.await.unwrap().unwrap();
        assert_eq!(terminal.phase, Phase::Ended);
    }

    #[tokio::test]
    async fn test_wait_terminal_after_publisher_drop() {
        let (publisher, reader) = channel(snapshot());

        let mut status = reader.snapshot();
        status.phase = Phase::Active;
        publisher.publish(&mut status);
        status.phase = Phase::Failed;
        publisher.publish(&mut status);
        drop(publisher);

        // The last published value satisfies the wait even though the
        // sender is gone.
        let mut reader = reader;
        let terminal = reader.wait_terminal().await.unwrap();
        assert_eq!(terminal.phase, Phase::Failed);
    }
}
