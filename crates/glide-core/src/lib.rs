//! # glide-core
//!
//! Rental session orchestration for shared-mobility devices.
//!
//! A *session* is one rider's pay-per-use rental of one device. Each
//! session runs as a single worker task that unlocks the device, meters
//! usage into a token ledger, blocks at a consumption threshold until
//! the rider approves further spend, and settles with the metering
//! gateway when the ride ends.
//!
//! ## Core concepts
//!
//! - **Token ledger**: unlock, elapsed-time, and distance charges, each
//!   posted to the gateway under an idempotency key so retries and
//!   replays never double-bill.
//! - **Completion journal**: an append-only record of finished steps; a
//!   session resumed from its journal picks up exactly where the
//!   previous run stopped.
//! - **Approval gate**: past the consumption threshold (70 tokens by
//!   default) the session blocks and waits for the rider's approval.
//!   Approval latches; the gate never re-triggers within a session.
//! - **Status projection**: every mutation publishes a consistent
//!   [`StatusSnapshot`](session::StatusSnapshot) to a watch channel, so
//!   queries never touch the worker task.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use glide_core::config::GlideConfig;
//! use glide_core::gateway::SimulatedGateway;
//! use glide_core::session::{Phase, RentalRequest, SessionRuntime};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let gateway = Arc::new(SimulatedGateway::new().with_customer("rider@example.com", "cus_1"));
//! let runtime = SessionRuntime::new(GlideConfig::default(), gateway);
//!
//! let session_id = runtime
//!     .start_session(RentalRequest {
//!         device_id: "1024".to_string(),
//!         email: "rider@example.com".to_string(),
//!         pricing: None,
//!     })
//!     .await
//!     .unwrap();
//!
//! runtime.signal_end(&session_id).await.unwrap();
//! let receipt = runtime.await_completion(&session_id).await.unwrap();
//!
//! assert_eq!(receipt.phase, Phase::Ended);
//! assert_eq!(receipt.tokens.total, 10); // unlock only
//! # }
//! ```

pub mod config;
pub mod device;
pub mod gateway;
pub mod invoker;
pub mod ledger;
pub mod session;

pub use config::GlideConfig;
pub use session::{RentalRequest, SessionRuntime};
