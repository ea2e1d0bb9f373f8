//! Scriptable in-memory metering gateway.
//!
//! Stands in for the real billing backend in demos and tests: a fixed
//! customer directory, recorded meter events with idempotency-key dedupe,
//! and an outage window that fails the first N charge-path calls.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CustomerRef, GatewayError, MeterEvent, MeteringGateway};

#[derive(Debug, Default)]
struct SimState {
    customers: HashMap<String, CustomerRef>,
    events: Vec<MeterEvent>,
    seen_keys: HashSet<String>,
    closed: Vec<CustomerRef>,
    outage_remaining: u32,
}

/// In-memory [`MeteringGateway`] with scriptable failures.
#[derive(Debug, Default)]
pub struct SimulatedGateway {
    state: Mutex<SimState>,
}

impl SimulatedGateway {
    /// Create an empty gateway with no known customers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a customer account for `email`.
    #[must_use]
    pub fn with_customer(
        mut self,
        email: impl Into<String>,
        customer_id: impl Into<String>,
    ) -> Self {
        self.state
            .get_mut()
            .customers
            .insert(email.into(), CustomerRef::new(customer_id));
        self
    }

    /// Fail the next `calls` charge-path calls (meter events and session
    /// closes) with [`GatewayError::Unavailable`]. Customer lookup is not
    /// affected.
    #[must_use]
    pub fn with_outage(mut self, calls: u32) -> Self {
        self.state.get_mut().outage_remaining = calls;
        self
    }

    /// Meter events accepted so far, in arrival order. Duplicate
    /// idempotency keys appear once.
    pub async fn events(&self) -> Vec<MeterEvent> {
        self.state.lock().await.events.clone()
    }

    /// Customers whose metering sessions have been closed.
    pub async fn closed_sessions(&self) -> Vec<CustomerRef> {
        self.state.lock().await.closed.clone()
    }

    fn take_outage(state: &mut SimState) -> Result<(), GatewayError> {
        if state.outage_remaining > 0 {
            state.outage_remaining -= 1;
            return Err(GatewayError::Unavailable {
                reason: "simulated outage".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MeteringGateway for SimulatedGateway {
    async fn find_customer(&self, email: &str) -> Result<CustomerRef, GatewayError> {
        let state = self.state.lock().await;
        state
            .customers
            .get(email)
            .cloned()
            .ok_or_else(|| GatewayError::CustomerNotFound {
                email: email.to_string(),
            })
    }

    async fn post_meter_event(&self, event: MeterEvent) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        Self::take_outage(&mut state)?;

        if !state.seen_keys.insert(event.idempotency_key.clone()) {
            debug!(key = %event.idempotency_key, "duplicate meter event dropped");
            return Ok(());
        }
        state.events.push(event);
        Ok(())
    }

    async fn close_account_session(&self, customer: &CustomerRef) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        Self::take_outage(&mut state)?;

        state.closed.push(customer.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ledger::ChargeCategory;

    use super::*;

    fn event(key: &str) -> MeterEvent {
        MeterEvent {
            customer: CustomerRef::new("cus_1"),
            category: ChargeCategory::Time,
            tokens: 2,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_find_customer() {
        let gateway = SimulatedGateway::new().with_customer("rider@example.com", "cus_1");

        let customer = gateway.find_customer("rider@example.com").await.unwrap();
        assert_eq!(customer.as_str(), "cus_1");

        let err = gateway.find_customer("nobody@example.com").await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::CustomerNotFound {
                email: "nobody@example.com".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_keys_recorded_once() {
        let gateway = SimulatedGateway::new();

        gateway.post_meter_event(event("k-1")).await.unwrap();
        gateway.post_meter_event(event("k-1")).await.unwrap();
        gateway.post_meter_event(event("k-2")).await.unwrap();

        let events = gateway.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].idempotency_key, "k-1");
        assert_eq!(events[1].idempotency_key, "k-2");
    }

    #[tokio::test]
    async fn test_outage_window() {
        let gateway = SimulatedGateway::new().with_outage(2);

        assert!(gateway.post_meter_event(event("k-1")).await.is_err());
        assert!(gateway.post_meter_event(event("k-1")).await.is_err());
        // Third call goes through
        gateway.post_meter_event(event("k-1")).await.unwrap();
        assert_eq!(gateway.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_outage_spares_lookup() {
        let gateway = SimulatedGateway::new()
            .with_customer("rider@example.com", "cus_1")
            .with_outage(1);

        // Lookup is unaffected by the outage window
        assert!(gateway.find_customer("rider@example.com").await.is_ok());
        assert!(gateway.post_meter_event(event("k-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_session_recorded() {
        let gateway = SimulatedGateway::new();
        let customer = CustomerRef::new("cus_9");

        gateway.close_account_session(&customer).await.unwrap();
        assert_eq!(gateway.closed_sessions().await, vec![customer]);
    }
}
