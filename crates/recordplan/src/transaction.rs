//! Transaction handle (spec §4.8, component C8).
//!
//! State machine `new → active → finished` with idempotence guards and
//! best-effort rollback after a failed commit. The monotonic transaction id
//! is a per-process atomic counter (spec §9 "remove hidden global state"),
//! not a bare mutable free variable.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::driver::DbDriver;
use crate::error::{PlanError, PlanResult};

static NEXT_TX_ID: AtomicI64 = AtomicI64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    New = 0,
    Active = 1,
    Finished = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::New,
            1 => State::Active,
            _ => State::Finished,
        }
    }
}

/// A transaction's lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEvent {
    Begin,
    Commit,
    Rollback,
}

/// A listener notified after a state transition. Errors are logged and
/// swallowed (spec §4.8) — never propagated back to the caller.
pub trait TxListener: Send + Sync {
    fn on_event(&self, tx_id: i64, event: TxEvent) -> PlanResult<()>;
}

/// Start/commit/rollback lifecycle over one driver connection.
pub struct TransactionHandle {
    id: i64,
    state: AtomicU8,
    driver: Arc<dyn DbDriver>,
    listeners: Vec<Arc<dyn TxListener>>,
}

impl TransactionHandle {
    pub fn new(driver: Arc<dyn DbDriver>) -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::New as u8),
            driver,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TxListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        State::from_u8(self.state.load(Ordering::Acquire)) == State::Active
    }

    pub fn is_finished(&self) -> bool {
        State::from_u8(self.state.load(Ordering::Acquire)) == State::Finished
    }

    fn fire(&self, event: TxEvent) {
        for listener in &self.listeners {
            if let Err(err) = listener.on_event(self.id, event) {
                tracing_or_eprintln(self.id, event, &err);
            }
        }
    }

    pub async fn start(&self) -> PlanResult<()> {
        let prev = self.state.compare_exchange(
            State::New as u8,
            State::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if prev.is_err() {
            return Err(PlanError::usage(format!(
                "transaction {} cannot start: already started or finished",
                self.id
            )));
        }
        self.driver.start_transaction().await?;
        self.fire(TxEvent::Begin);
        Ok(())
    }

    pub async fn commit(&self) -> PlanResult<()> {
        self.require_active("commit")?;
        let result = self.driver.commit_transaction().await;
        match result {
            Ok(()) => {
                self.state.store(State::Finished as u8, Ordering::Release);
                self.fire(TxEvent::Commit);
                Ok(())
            }
            Err(commit_err) => {
                // Best-effort rollback on failed commit; the original error
                // is surfaced regardless of rollback outcome.
                self.state.store(State::Finished as u8, Ordering::Release);
                let _ = self.driver.rollback_transaction().await;
                self.fire(TxEvent::Rollback);
                Err(commit_err)
            }
        }
    }

    pub async fn rollback(&self) -> PlanResult<()> {
        self.require_active("rollback")?;
        self.state.store(State::Finished as u8, Ordering::Release);
        self.driver.rollback_transaction().await?;
        self.fire(TxEvent::Rollback);
        Ok(())
    }

    fn require_active(&self, op: &str) -> PlanResult<()> {
        if !self.is_active() {
            return Err(PlanError::usage(format!(
                "cannot {op} transaction {}: not active",
                self.id
            )));
        }
        Ok(())
    }
}

fn tracing_or_eprintln(tx_id: i64, event: TxEvent, err: &PlanError) {
    #[cfg(feature = "tracing")]
    {
        tracing::warn!(tx_id, ?event, error = %err, "transaction listener failed");
    }
    #[cfg(not(feature = "tracing"))]
    {
        let _ = (tx_id, event, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::InMemoryDriver;

    #[tokio::test]
    async fn start_commit_happy_path() {
        let driver = Arc::new(InMemoryDriver::new());
        let tx = TransactionHandle::new(driver.clone());
        tx.start().await.unwrap();
        assert!(tx.is_active());
        tx.commit().await.unwrap();
        assert!(tx.is_finished());
    }

    #[tokio::test]
    async fn double_start_is_usage_error() {
        let driver = Arc::new(InMemoryDriver::new());
        let tx = TransactionHandle::new(driver);
        tx.start().await.unwrap();
        assert!(tx.start().await.unwrap_err().is_usage());
    }

    #[tokio::test]
    async fn commit_without_start_is_usage_error() {
        let driver = Arc::new(InMemoryDriver::new());
        let tx = TransactionHandle::new(driver);
        assert!(tx.commit().await.unwrap_err().is_usage());
    }

    #[tokio::test]
    async fn each_transaction_gets_a_unique_monotonic_id() {
        let driver = Arc::new(InMemoryDriver::new());
        let a = TransactionHandle::new(driver.clone());
        let b = TransactionHandle::new(driver);
        assert!(b.id() > a.id());
    }
}
