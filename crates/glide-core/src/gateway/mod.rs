//! Metering gateway abstraction.
//!
//! The orchestrator never talks to a payment provider directly; it posts
//! usage through [`MeteringGateway`]. The trait is the seam between the
//! session state machine and whatever backend carries the charges. A
//! scriptable in-memory implementation lives in [`sim`] for demos and
//! tests.

pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use sim::SimulatedGateway;

use crate::ledger::ChargeCategory;

/// Customer account reference resolved by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerRef(String);

impl CustomerRef {
    /// Wrap a gateway-issued customer identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CustomerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One usage charge posted to the gateway.
///
/// The idempotency key is stable across retries and replays of the same
/// logical charge, so the gateway can absorb duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterEvent {
    /// Customer the charge is billed to.
    pub customer: CustomerRef,

    /// Charge category.
    pub category: ChargeCategory,

    /// Tokens consumed by this event.
    pub tokens: u64,

    /// Deduplication key, unique per logical charge.
    pub idempotency_key: String,
}

/// Gateway-side failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// No customer account matches the given email address.
    #[error("no customer found for {email}")]
    CustomerNotFound {
        /// Email address that failed to resolve.
        email: String,
    },

    /// The gateway could not be reached or answered with a transient
    /// failure. Safe to retry.
    #[error("metering gateway unavailable: {reason}")]
    Unavailable {
        /// Backend-provided failure description.
        reason: String,
    },
}

/// Outbound interface to the usage-metering backend.
///
/// Implementations must tolerate duplicate [`MeterEvent`]s carrying the
/// same idempotency key; the orchestrator relies on that for crash
/// recovery.
#[async_trait]
pub trait MeteringGateway: Send + Sync + std::fmt::Debug {
    /// Resolve a customer account from an email address.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CustomerNotFound`] if the address is
    /// unknown, or [`GatewayError::Unavailable`] on transient failure.
    async fn find_customer(&self, email: &str) -> Result<CustomerRef, GatewayError>;

    /// Post one usage charge.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unavailable`] on transient failure.
    async fn post_meter_event(&self, event: MeterEvent) -> Result<(), GatewayError>;

    /// Close the customer's metering session after the rental ends.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unavailable`] on transient failure.
    async fn close_account_session(&self, customer: &CustomerRef) -> Result<(), GatewayError>;
}
