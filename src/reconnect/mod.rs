use crate::connection::EngineSignal;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectState {
    Idle,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Timer no longer matches the pending retry (cancelled or superseded).
    Stale,
    Reopen(String),
    /// Session lost its account during the wait; back to idle.
    Abandon,
}

#[derive(Debug)]
struct RetryTimer {
    ticket: u64,
    task: JoinHandle<()>,
}

/// Fixed-interval retry after an unexpected channel drop. Retries as long as
/// the session keeps an account; no growth, no attempt ceiling.
#[derive(Debug)]
pub struct ReconnectPolicy {
    interval: Duration,
    state: ReconnectState,
    timer: Option<RetryTimer>,
    next_ticket: u64,
}

impl ReconnectPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: ReconnectState::Idle,
            timer: None,
            next_ticket: 0,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[cfg(test)]
    pub fn has_pending_retry(&self) -> bool {
        self.timer.is_some()
    }

    pub fn on_opened(&mut self) {
        self.cancel_timer();
        self.state = ReconnectState::Connected;
    }

    /// Enters `Reconnecting` and schedules a `RetryDue` signal one interval out.
    pub fn on_unexpected_close(&mut self, signals: &mpsc::UnboundedSender<EngineSignal>) {
        self.cancel_timer();
        self.state = ReconnectState::Reconnecting;
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let deadline = Instant::now() + self.interval;
        let signals = signals.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = signals.send(EngineSignal::RetryDue { ticket });
        });
        self.timer = Some(RetryTimer { ticket, task });
    }

    pub fn on_retry_due(&mut self, ticket: u64, account_id: Option<&str>) -> RetryDecision {
        if self.timer.as_ref().map(|t| t.ticket) != Some(ticket) {
            return RetryDecision::Stale;
        }
        self.timer = None;
        if self.state != ReconnectState::Reconnecting {
            return RetryDecision::Stale;
        }
        match account_id {
            Some(account_id) => RetryDecision::Reopen(account_id.to_string()),
            None => {
                self.state = ReconnectState::Idle;
                RetryDecision::Abandon
            }
        }
    }

    /// A fresh open supersedes any scheduled retry; the state is left for
    /// the open's outcome to settle.
    pub fn cancel_pending(&mut self) {
        self.cancel_timer();
    }

    /// Explicit close: back to idle from any state.
    pub fn reset(&mut self) {
        self.cancel_timer();
        self.state = ReconnectState::Idle;
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.task.abort();
        }
    }
}

impl Drop for ReconnectPolicy {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(250);

    #[tokio::test(start_paused = true)]
    async fn retry_due_reopens_with_current_account() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut policy = ReconnectPolicy::new(INTERVAL);
        policy.on_opened();
        assert_eq!(policy.state(), ReconnectState::Connected);

        policy.on_unexpected_close(&tx);
        assert_eq!(policy.state(), ReconnectState::Reconnecting);
        assert!(policy.has_pending_retry());

        let EngineSignal::RetryDue { ticket } = rx.recv().await.unwrap() else {
            panic!("expected retry signal");
        };
        assert_eq!(
            policy.on_retry_due(ticket, Some("A1")),
            RetryDecision::Reopen("A1".to_string())
        );
        assert_eq!(policy.state(), ReconnectState::Reconnecting);
        assert_eq!(policy.on_retry_due(ticket, Some("A1")), RetryDecision::Stale);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_without_account_goes_idle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut policy = ReconnectPolicy::new(INTERVAL);
        policy.on_unexpected_close(&tx);

        let EngineSignal::RetryDue { ticket } = rx.recv().await.unwrap() else {
            panic!("expected retry signal");
        };
        assert_eq!(policy.on_retry_due(ticket, None), RetryDecision::Abandon);
        assert_eq!(policy.state(), ReconnectState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn second_drop_supersedes_first_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut policy = ReconnectPolicy::new(INTERVAL);
        policy.on_unexpected_close(&tx);
        policy.on_unexpected_close(&tx);

        let EngineSignal::RetryDue { ticket } = rx.recv().await.unwrap() else {
            panic!("expected retry signal");
        };
        assert_eq!(ticket, 2);
        tokio::time::advance(INTERVAL * 4).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut policy = ReconnectPolicy::new(INTERVAL);
        policy.on_unexpected_close(&tx);
        policy.reset();

        assert_eq!(policy.state(), ReconnectState::Idle);
        assert!(!policy.has_pending_retry());
        tokio::time::advance(INTERVAL * 2).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
