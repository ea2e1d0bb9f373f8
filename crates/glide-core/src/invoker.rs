//! Billing activity invoker.
//!
//! Every outbound metering call flows through a single retry engine:
//! exponential backoff between attempts, a timeout around each attempt,
//! and a closed failure classification. The invoker never touches session
//! state; it is pure call-and-return.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::RetryConfig;
use crate::gateway::{CustomerRef, GatewayError, MeterEvent, MeteringGateway};
use crate::ledger::ChargeCategory;

/// Outbound operations the invoker performs, with stable names used in
/// logs and idempotency keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillingOp {
    /// Resolve the customer account from an email address.
    LookupCustomer,
    /// Post the one-time unlock charge.
    ChargeUnlock,
    /// Post an elapsed-time meter charge.
    ChargeTime,
    /// Post a distance increment charge.
    ChargeDistance,
    /// Close the customer's metering session.
    CloseSession,
}

impl BillingOp {
    /// Stable operation name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LookupCustomer => "lookup-customer",
            Self::ChargeUnlock => "charge-unlock",
            Self::ChargeTime => "charge-time",
            Self::ChargeDistance => "charge-distance",
            Self::CloseSession => "close-session",
        }
    }

    /// The charge operation for a ledger category.
    #[must_use]
    pub const fn for_category(category: ChargeCategory) -> Self {
        match category {
            ChargeCategory::Unlock => Self::ChargeUnlock,
            ChargeCategory::Time => Self::ChargeTime,
            ChargeCategory::Distance => Self::ChargeDistance,
        }
    }
}

impl std::fmt::Display for BillingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classification for billing activities.
///
/// `Transient` failures are retried in place; callers of the invoker see
/// success, [`ActivityError::CustomerNotFound`], or
/// [`ActivityError::RetriesExhausted`] once a bounded budget runs out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivityError {
    /// The customer account does not exist. Never retried.
    #[error("no customer found for {email}")]
    CustomerNotFound {
        /// Email address that failed to resolve.
        email: String,
    },

    /// A single attempt failed in a way that is safe to retry.
    #[error("transient failure on {op}: {reason}")]
    Transient {
        /// Operation name.
        op: &'static str,
        /// Failure description.
        reason: String,
    },

    /// A bounded attempt budget ran out.
    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Operation name.
        op: &'static str,
        /// Attempts made before giving up.
        attempts: u32,
        /// Description of the final failure.
        last: String,
    },
}

/// Uniform retry wrapper around the metering gateway.
///
/// One invoker serves one session; the session id scopes every
/// idempotency key it issues.
#[derive(Debug)]
pub struct BillingInvoker {
    gateway: Arc<dyn MeteringGateway>,
    retry: RetryConfig,
    scope: String,
}

impl BillingInvoker {
    /// Create an invoker for the session identified by `scope`.
    pub fn new(gateway: Arc<dyn MeteringGateway>, retry: RetryConfig, scope: impl Into<String>) -> Self {
        Self {
            gateway,
            retry,
            scope: scope.into(),
        }
    }

    /// Deduplication key for one logical charge. Stable across retries
    /// and replays.
    #[must_use]
    pub fn idempotency_key(&self, op: BillingOp, seq: u64) -> String {
        format!("{}:{}:{}", self.scope, op.as_str(), seq)
    }

    /// Resolve the customer account for `email`.
    ///
    /// # Errors
    ///
    /// Returns [`ActivityError::CustomerNotFound`] immediately if the
    /// address is unknown, or [`ActivityError::RetriesExhausted`] if a
    /// bounded attempt budget runs out.
    #[instrument(skip(self), fields(session = %self.scope))]
    pub async fn lookup_customer(&self, email: &str) -> Result<CustomerRef, ActivityError> {
        self.run_with_retry(BillingOp::LookupCustomer, || async move {
            self.gateway.find_customer(email).await
        })
        .await
    }

    /// Post one usage charge for `tokens` in `category`.
    ///
    /// `seq` numbers the logical charge within its category; retries and
    /// replays of the same charge reuse the same `seq` and therefore the
    /// same idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`ActivityError::RetriesExhausted`] if a bounded attempt
    /// budget runs out.
    #[instrument(skip(self, customer), fields(session = %self.scope, category = category.as_str(), seq))]
    pub async fn charge(
        &self,
        customer: &CustomerRef,
        category: ChargeCategory,
        tokens: u64,
        seq: u64,
    ) -> Result<(), ActivityError> {
        let op = BillingOp::for_category(category);
        let key = self.idempotency_key(op, seq);
        self.run_with_retry(op, || {
            let event = MeterEvent {
                customer: customer.clone(),
                category,
                tokens,
                idempotency_key: key.clone(),
            };
            async move { self.gateway.post_meter_event(event).await }
        })
        .await
    }

    /// Close the customer's metering session.
    ///
    /// # Errors
    ///
    /// Returns [`ActivityError::RetriesExhausted`] if a bounded attempt
    /// budget runs out.
    #[instrument(skip(self, customer), fields(session = %self.scope))]
    pub async fn close_session(&self, customer: &CustomerRef) -> Result<(), ActivityError> {
        self.run_with_retry(BillingOp::CloseSession, || async move {
            self.gateway.close_account_session(customer).await
        })
        .await
    }

    /// Drive `call` until it succeeds, fails fatally, or the attempt
    /// budget runs out. Each attempt is bounded by the configured call
    /// timeout; a timed-out attempt classifies as transient.
    async fn run_with_retry<T, F, Fut>(&self, op: BillingOp, mut call: F) -> Result<T, ActivityError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let reason = match timeout(self.retry.call_timeout, call()).await {
                Ok(Ok(value)) => {
                    debug!(op = %op, attempts, "billing call succeeded");
                    return Ok(value);
                },
                Ok(Err(err)) => match classify(op, err) {
                    ActivityError::Transient { reason, .. } => reason,
                    fatal => return Err(fatal),
                },
                Err(_elapsed) => format!(
                    "attempt timed out after {}",
                    humantime::format_duration(self.retry.call_timeout)
                ),
            };

            if !self.retry.allows_attempt(attempts) {
                warn!(op = %op, attempts, last = %reason, "retry budget exhausted");
                return Err(ActivityError::RetriesExhausted {
                    op: op.as_str(),
                    attempts,
                    last: reason,
                });
            }

            let delay = self.retry.delay_for_attempt(attempts);
            warn!(op = %op, attempt = attempts, delay = ?delay, reason = %reason, "billing call failed, backing off");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Classify one failed gateway call. Transient failures stay inside
/// the retry loop; anything else aborts the operation.
fn classify(op: BillingOp, err: GatewayError) -> ActivityError {
    match err {
        GatewayError::CustomerNotFound { email } => ActivityError::CustomerNotFound { email },
        GatewayError::Unavailable { reason } => ActivityError::Transient {
            op: op.as_str(),
            reason,
        },
    }
}
