//! Budget accounting and the execution-wide cancellation signal.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Notify;

use rlm_protocol::BudgetSnapshot;
use rlm_protocol::ConsumedBudget;
use rlm_protocol::ExecutionStatus;

/// Cooperative cancellation flag shared by every suspension point of an
/// execution. Cancelling is idempotent; waiters wake at most once per
/// `cancel()` and re-check the flag.
#[derive(Default)]
pub struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve when cancellation is requested. Completes immediately if the
    /// flag is already set.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

/// Wall-clock tracking plus total-budget checks performed before each LLM or
/// tool call and after each turn.
pub struct BudgetClock {
    started: Instant,
    budgets: BudgetSnapshot,
}

impl BudgetClock {
    pub fn new(budgets: BudgetSnapshot) -> Self {
        Self {
            started: Instant::now(),
            budgets,
        }
    }

    pub fn budgets(&self) -> &BudgetSnapshot {
        &self.budgets
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Time left before the execution-wide deadline, floored at zero.
    pub fn remaining_total(&self) -> Duration {
        Duration::from_secs(self.budgets.max_total_seconds).saturating_sub(self.started.elapsed())
    }

    /// Deadline for a single step, additionally bounded by the remaining
    /// total budget.
    pub fn step_deadline(&self) -> Duration {
        Duration::from_secs(self.budgets.max_step_seconds).min(self.remaining_total())
    }

    /// Terminal status implied by the totals, if any. Turn and wall limits
    /// map to distinct terminal states; the remaining totals collapse into
    /// `BUDGET_EXCEEDED`.
    pub fn exceeded(&self, consumed: &ConsumedBudget) -> Option<ExecutionStatus> {
        if consumed.turns >= self.budgets.max_turns {
            return Some(ExecutionStatus::MaxTurnsExceeded);
        }
        if self.elapsed() >= Duration::from_secs(self.budgets.max_total_seconds) {
            return Some(ExecutionStatus::Timeout);
        }
        if consumed.spans > self.budgets.max_spans_total
            || consumed.llm_prompt_chars > self.budgets.max_total_llm_prompt_chars
        {
            return Some(ExecutionStatus::BudgetExceeded);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[tokio::test]
    async fn cancel_is_idempotent_and_wakes_waiters() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.cancelled().await })
        };
        signal.cancel();
        signal.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
        // A waiter arriving after the fact completes immediately.
        signal.cancelled().await;
    }

    #[test]
    fn totals_map_to_terminal_statuses() {
        let clock = BudgetClock::new(BudgetSnapshot {
            max_turns: 2,
            max_total_seconds: 600,
            ..BudgetSnapshot::default()
        });
        let mut consumed = ConsumedBudget::default();
        assert_eq!(clock.exceeded(&consumed), None);

        consumed.turns = 2;
        assert_eq!(
            clock.exceeded(&consumed),
            Some(ExecutionStatus::MaxTurnsExceeded)
        );

        consumed.turns = 1;
        consumed.spans = 1_000_000;
        assert_eq!(
            clock.exceeded(&consumed),
            Some(ExecutionStatus::BudgetExceeded)
        );
    }
}
