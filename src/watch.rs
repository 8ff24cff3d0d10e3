use crate::error::{CheckoutError, Result};
use crate::psp::{CheckoutProvider, PaymentRecord, PaymentStatus};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            deadline: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    /// False when the provider reported a move the state machine does not allow.
    pub allowed: bool,
}

#[derive(Debug, Clone)]
pub struct WatchOutcome {
    pub record: PaymentRecord,
    pub transitions: Vec<Transition>,
    pub timed_out: bool,
}

/// Polls `payment_id` until it settles or `options.deadline` passes.
///
/// Only observes: an out-of-order transition is recorded and logged, never
/// corrected. Lookup errors end the watch immediately.
pub async fn watch_payment(
    provider: &dyn CheckoutProvider,
    payment_id: &str,
    options: WatchOptions,
) -> Result<WatchOutcome> {
    if options.interval.is_zero() {
        return Err(CheckoutError::Validation(
            "watch interval must be greater than zero".into(),
        ));
    }

    let started = Instant::now();
    let mut interval = tokio::time::interval(options.interval);
    let mut transitions = Vec::new();
    let mut last: Option<PaymentStatus> = None;

    loop {
        interval.tick().await;

        let record = provider.get_payment(payment_id).await?;

        if let Some(prev) = last {
            if prev != record.status {
                let allowed = prev.can_transition_to(record.status);
                let to = record.status;
                if allowed {
                    info!(payment_id, from = %prev, %to, "payment status changed");
                } else {
                    warn!(payment_id, from = %prev, %to, "provider reported unexpected transition");
                }
                transitions.push(Transition {
                    from: prev,
                    to: record.status,
                    allowed,
                });
            }
        }
        last = Some(record.status);

        if record.status.is_terminal() {
            return Ok(WatchOutcome {
                record,
                transitions,
                timed_out: false,
            });
        }
        if started.elapsed() >= options.deadline {
            warn!(payment_id, status = %record.status, "stopped watching before payment settled");
            return Ok(WatchOutcome {
                record,
                transitions,
                timed_out: true,
            });
        }
    }
}
