//! In-process implementations of the collaborator traits.
//!
//! Used by the test suite and by a node started without a real processor.
//! The sandbox gateway keeps its own ledger of holds so it can reject
//! over-captures the way a real processor would, and lets callers inject
//! failures and latency per operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    CaptureReceipt, EventKind, GatewayError, HoldConfirmation, HoldReceipt, MediatorDirectory,
    Notifier, NotifyError, PaymentGateway, RefundReceipt, TransferReceipt,
};

/// Gateway operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    CreateHold,
    ConfirmHold,
    Capture,
    Refund,
    Transfer,
}

#[derive(Debug, Clone)]
struct SandboxHold {
    amount: u64,
    captured: u64,
    confirmed: bool,
    refunded: bool,
}

#[derive(Default)]
struct SandboxState {
    holds: HashMap<String, SandboxHold>,
    failures: HashMap<GatewayOp, GatewayError>,
    one_shot: HashMap<GatewayOp, GatewayError>,
    delays: HashMap<GatewayOp, Duration>,
    calls: HashMap<GatewayOp, usize>,
    transfers: Vec<TransferReceipt>,
}

/// Payment gateway that settles everything in memory.
#[derive(Default)]
pub struct SandboxGateway {
    state: Mutex<SandboxState>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call to `op` fail with `error` until cleared.
    pub fn fail(&self, op: GatewayOp, error: GatewayError) {
        self.state.lock().failures.insert(op, error);
    }

    /// Makes only the next call to `op` fail.
    pub fn fail_once(&self, op: GatewayOp, error: GatewayError) {
        self.state.lock().one_shot.insert(op, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.one_shot.clear();
    }

    /// Delays every call to `op` by `delay`.
    pub fn delay(&self, op: GatewayOp, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    pub fn calls(&self, op: GatewayOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Amount captured so far against `hold_id`.
    pub fn captured(&self, hold_id: &str) -> u64 {
        self.state
            .lock()
            .holds
            .get(hold_id)
            .map(|h| h.captured)
            .unwrap_or(0)
    }

    pub fn is_refunded(&self, hold_id: &str) -> bool {
        self.state
            .lock()
            .holds
            .get(hold_id)
            .map(|h| h.refunded)
            .unwrap_or(false)
    }

    pub fn transfers(&self) -> Vec<TransferReceipt> {
        self.state.lock().transfers.clone()
    }

    /// Counts the call, then applies injected latency and failures.
    async fn enter(&self, op: GatewayOp) -> Result<(), GatewayError> {
        let (delay, failure) = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            let failure = state
                .one_shot
                .remove(&op)
                .or_else(|| state.failures.get(&op).cloned());
            (state.delays.get(&op).copied(), failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reference(prefix: &str) -> String {
        format!("{}_{}", prefix, Uuid::new_v4().simple())
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_hold(
        &self,
        _transaction_id: &str,
        amount: u64,
        currency: &str,
    ) -> Result<HoldReceipt, GatewayError> {
        self.enter(GatewayOp::CreateHold).await?;
        let hold_id = Self::reference("hold");
        self.state.lock().holds.insert(
            hold_id.clone(),
            SandboxHold {
                amount,
                captured: 0,
                confirmed: false,
                refunded: false,
            },
        );
        Ok(HoldReceipt {
            hold_id,
            amount,
            currency: currency.to_string(),
        })
    }

    async fn confirm_hold(
        &self,
        hold_id: &str,
        payment_method: &str,
    ) -> Result<HoldConfirmation, GatewayError> {
        self.enter(GatewayOp::ConfirmHold).await?;
        let mut state = self.state.lock();
        let hold = state
            .holds
            .get_mut(hold_id)
            .ok_or_else(|| GatewayError::UnknownHold(hold_id.to_string()))?;
        hold.confirmed = true;
        Ok(HoldConfirmation {
            hold_id: hold_id.to_string(),
            payment_method: payment_method.to_string(),
        })
    }

    async fn capture(&self, hold_id: &str, amount: u64) -> Result<CaptureReceipt, GatewayError> {
        self.enter(GatewayOp::Capture).await?;
        let mut state = self.state.lock();
        let hold = state
            .holds
            .get_mut(hold_id)
            .ok_or_else(|| GatewayError::UnknownHold(hold_id.to_string()))?;
        if !hold.confirmed || hold.refunded {
            return Err(GatewayError::Declined(format!(
                "hold {} is not capturable",
                hold_id
            )));
        }
        if hold.captured + amount > hold.amount {
            return Err(GatewayError::Declined(format!(
                "capture of {} exceeds remaining {}",
                amount,
                hold.amount - hold.captured
            )));
        }
        hold.captured += amount;
        Ok(CaptureReceipt {
            hold_id: hold_id.to_string(),
            amount,
            reference: Self::reference("cap"),
        })
    }

    async fn refund(&self, hold_id: &str) -> Result<RefundReceipt, GatewayError> {
        self.enter(GatewayOp::Refund).await?;
        let mut state = self.state.lock();
        let hold = state
            .holds
            .get_mut(hold_id)
            .ok_or_else(|| GatewayError::UnknownHold(hold_id.to_string()))?;
        if hold.refunded {
            return Err(GatewayError::Declined(format!(
                "hold {} already refunded",
                hold_id
            )));
        }
        hold.refunded = true;
        Ok(RefundReceipt {
            hold_id: hold_id.to_string(),
            amount: hold.amount - hold.captured,
            reference: Self::reference("ref"),
        })
    }

    async fn transfer(&self, seller_id: &str, amount: u64) -> Result<TransferReceipt, GatewayError> {
        self.enter(GatewayOp::Transfer).await?;
        let receipt = TransferReceipt {
            seller_id: seller_id.to_string(),
            amount,
            reference: Self::reference("po"),
        };
        self.state.lock().transfers.push(receipt.clone());
        Ok(receipt)
    }
}

/// Hands out mediators from a fixed pool in rotation.
pub struct RoundRobinMediators {
    pool: Vec<String>,
    next: AtomicUsize,
}

impl RoundRobinMediators {
    pub fn new(pool: Vec<String>) -> Self {
        Self {
            pool,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MediatorDirectory for RoundRobinMediators {
    async fn assign(&self, _dispute_id: &str) -> Result<String, GatewayError> {
        if self.pool.is_empty() {
            return Err(GatewayError::NoMediator);
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        Ok(self.pool[i].clone())
    }
}

/// A notification as captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub user_id: String,
    pub event: EventKind,
    pub transaction_id: String,
    pub message: String,
}

/// Keeps every notification in memory. Can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }

    pub fn count(&self, event: EventKind) -> usize {
        self.sent.lock().iter().filter(|n| n.event == event).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        user_id: &str,
        event: EventKind,
        transaction_id: &str,
        message: &str,
    ) -> Result<(), NotifyError> {
        if *self.failing.lock() {
            return Err(NotifyError("notifier offline".into()));
        }
        self.sent.lock().push(SentNotification {
            user_id: user_id.to_string(),
            event,
            transaction_id: transaction_id.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

/// Notifier that only writes to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        user_id: &str,
        event: EventKind,
        transaction_id: &str,
        message: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!(user_id, ?event, transaction_id, message, "notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_are_cumulative_and_bounded() {
        let gw = SandboxGateway::new();
        let hold = gw.create_hold("tx", 100, "USD").await.unwrap();
        gw.confirm_hold(&hold.hold_id, "card").await.unwrap();

        gw.capture(&hold.hold_id, 40).await.unwrap();
        gw.capture(&hold.hold_id, 60).await.unwrap();
        assert_eq!(gw.captured(&hold.hold_id), 100);
        assert!(gw.capture(&hold.hold_id, 1).await.is_err());
    }

    #[tokio::test]
    async fn unconfirmed_hold_cannot_be_captured() {
        let gw = SandboxGateway::new();
        let hold = gw.create_hold("tx", 100, "USD").await.unwrap();
        assert!(matches!(
            gw.capture(&hold.hold_id, 100).await,
            Err(GatewayError::Declined(_))
        ));
    }

    #[tokio::test]
    async fn refund_returns_uncaptured_rest() {
        let gw = SandboxGateway::new();
        let hold = gw.create_hold("tx", 100, "USD").await.unwrap();
        gw.confirm_hold(&hold.hold_id, "card").await.unwrap();
        gw.capture(&hold.hold_id, 30).await.unwrap();
        let refund = gw.refund(&hold.hold_id).await.unwrap();
        assert_eq!(refund.amount, 70);
        assert!(gw.is_refunded(&hold.hold_id));
    }

    #[tokio::test]
    async fn one_shot_failure_clears_itself() {
        let gw = SandboxGateway::new();
        gw.fail_once(GatewayOp::Transfer, GatewayError::Unavailable("down".into()));
        assert!(gw.transfer("s", 10).await.is_err());
        assert!(gw.transfer("s", 10).await.is_ok());
        assert_eq!(gw.calls(GatewayOp::Transfer), 2);
        assert_eq!(gw.transfers().len(), 1);
    }

    #[tokio::test]
    async fn mediators_rotate() {
        let dir = RoundRobinMediators::new(vec!["m1".into(), "m2".into()]);
        assert_eq!(dir.assign("d").await.unwrap(), "m1");
        assert_eq!(dir.assign("d").await.unwrap(), "m2");
        assert_eq!(dir.assign("d").await.unwrap(), "m1");

        let empty = RoundRobinMediators::new(vec![]);
        assert_eq!(empty.assign("d").await, Err(GatewayError::NoMediator));
    }
}
