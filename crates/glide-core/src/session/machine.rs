//! Session state machine.
//!
//! One task owns all state for one rental session. It suspends in exactly
//! three places: awaiting a billing call, racing the meter deadline
//! against the signal inbox, and waiting out the approval gate. Signal
//! senders only enqueue; every mutation happens on this task, and every
//! mutation is followed by a snapshot publication.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::{GlideConfig, SessionConfig, TariffConfig};
use crate::device::{DeviceId, DeviceIdError};
use crate::gateway::{CustomerRef, MeteringGateway};
use crate::invoker::{ActivityError, BillingInvoker, BillingOp};
use crate::ledger::{ChargeCategory, Pricing};

use super::journal::{
    step, CompletedStep, CompletionJournal, JournalError, Replay, StartRecord, StepOutcome,
};
use super::projection::{self, StatusPublisher, StatusReader};
use super::signal::Signal;
use super::state::{Phase, SessionId, StatusSnapshot};

/// Everything needed to start one rental session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RentalRequest {
    /// Raw device identifier. Validated during startup, after customer
    /// resolution.
    pub device_id: String,

    /// Rider email, resolved to a customer account at startup.
    pub email: String,

    /// Pricing override; configuration defaults apply when `None`.
    pub pricing: Option<Pricing>,
}

/// Fatal session failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The device identifier failed validation. Local and fatal; the
    /// gateway is never charged.
    #[error(transparent)]
    InvalidDeviceId(#[from] DeviceIdError),

    /// A billing activity failed fatally.
    #[error(transparent)]
    Billing(#[from] ActivityError),

    /// The completion journal could not persist a step.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// The journal carries no start record to resume from.
    #[error("journal has no session start record")]
    NotResumable,

    /// Invariant violation inside the worker.
    #[error("internal session error: {reason}")]
    Internal {
        /// What went wrong.
        reason: String,
    },
}

/// How the approval wait resolved.
enum GateOutcome {
    Approved,
    EndRequested,
    Deadline,
}

/// The orchestration loop for one rental session.
pub struct SessionMachine {
    session: SessionConfig,
    tariff: TariffConfig,
    email: String,
    invoker: BillingInvoker,
    journal: Box<dyn CompletionJournal>,
    inbox: mpsc::UnboundedReceiver<Signal>,
    publisher: StatusPublisher,
    status: StatusSnapshot,

    customer: Option<CustomerRef>,
    /// Distance credits (in feet) awaiting their charge, oldest first.
    pending_distances: VecDeque<u64>,
    end_requested: bool,
    gate_satisfied: bool,
    next_time_seq: u64,
    next_distance_seq: u64,
    /// The one outstanding meter deadline. Replaced when it fires, never
    /// stacked; signals leave it untouched.
    meter_deadline: Instant,
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("session_id", &self.status.session_id)
            .field("phase", &self.status.phase)
            .field("tokens", &self.status.tokens)
            .finish_non_exhaustive()
    }
}

impl SessionMachine {
    /// Create a machine for a fresh rental.
    ///
    /// The journal must be fresh; resuming a previous run's journal goes
    /// through [`SessionMachine::resume`]. Returns the machine and the
    /// query handle; the machine does nothing until [`run`](Self::run).
    pub fn start(
        request: RentalRequest,
        config: &GlideConfig,
        gateway: Arc<dyn MeteringGateway>,
        journal: Box<dyn CompletionJournal>,
        inbox: mpsc::UnboundedReceiver<Signal>,
    ) -> (Self, StatusReader) {
        let pricing = request
            .pricing
            .unwrap_or_else(|| Pricing::from(&config.pricing));
        let record = StartRecord {
            session_id: SessionId::generate(&request.device_id),
            device_id: request.device_id,
            email: request.email,
            pricing,
            started_at: Utc::now(),
        };
        Self::build(record, config, gateway, journal, inbox)
    }

    /// Recreate a machine from a journal written by a previous run.
    ///
    /// Identity, pricing, and all completed steps come from the journal;
    /// the resumed session keeps the original session id and therefore
    /// the original idempotency keys.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotResumable`] if the journal has no start
    /// record.
    pub fn resume(
        config: &GlideConfig,
        gateway: Arc<dyn MeteringGateway>,
        journal: Box<dyn CompletionJournal>,
        inbox: mpsc::UnboundedReceiver<Signal>,
    ) -> Result<(Self, StatusReader), SessionError> {
        let record = journal
            .steps()
            .iter()
            .find_map(|entry| match &entry.outcome {
                StepOutcome::Started(record) => Some(record.clone()),
                _ => None,
            })
            .ok_or(SessionError::NotResumable)?;
        Ok(Self::build(record, config, gateway, journal, inbox))
    }

    fn build(
        record: StartRecord,
        config: &GlideConfig,
        gateway: Arc<dyn MeteringGateway>,
        journal: Box<dyn CompletionJournal>,
        inbox: mpsc::UnboundedReceiver<Signal>,
    ) -> (Self, StatusReader) {
        let replay = Replay::from_journal(journal.as_ref(), config.tariff.feet_per_increment);

        let mut status = StatusSnapshot::initial(
            record.session_id.clone(),
            record.device_id,
            record.pricing,
        );
        status.started_at = record.started_at;
        status.last_meter_at = replay.last_meter_at.unwrap_or(record.started_at);
        status.tokens = replay.ledger;
        status.distance_ft = replay.distance_ft;
        status.amount_due_minor = status.pricing.amount_due(status.tokens.total);
        if let Some((phase, ended_at)) = replay.closed {
            status.phase = phase;
            status.ended_at = Some(ended_at);
        } else if replay.unlocked {
            status.phase = Phase::Active;
        }

        let invoker =
            BillingInvoker::new(gateway, config.retry.clone(), record.session_id.as_str());
        let (publisher, reader) = projection::channel(status.clone());

        let machine = Self {
            session: config.session.clone(),
            tariff: config.tariff.clone(),
            email: record.email,
            invoker,
            journal,
            inbox,
            publisher,
            status,
            customer: replay.customer,
            pending_distances: VecDeque::new(),
            end_requested: false,
            gate_satisfied: replay.gate_satisfied,
            next_time_seq: replay.next_time_seq,
            next_distance_seq: replay.next_distance_seq,
            meter_deadline: Instant::now(),
        };
        (machine, reader)
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.status.session_id
    }

    /// Drive the session to a terminal phase.
    ///
    /// Returns the terminal snapshot on `ENDED` and `TIMED_OUT`. On
    /// `FAILED` the error is returned and the published snapshot carries
    /// its display text in `last_error`.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`SessionError`] that failed the session.
    pub async fn run(mut self) -> Result<StatusSnapshot, SessionError> {
        if self.status.phase.is_terminal() {
            info!(
                session = %self.status.session_id,
                phase = %self.status.phase,
                "session already closed; republishing terminal snapshot"
            );
            self.publish();
            return Ok(self.status.clone());
        }

        match self.drive().await {
            Ok(()) => Ok(self.status.clone()),
            Err(err) => {
                self.fail(&err);
                Err(err)
            },
        }
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        self.record_start()?;
        self.publish();

        // Startup: resolve the customer, validate the device, charge the
        // unlock. Order matters; validation is local and must precede the
        // first charge.
        if self.customer.is_none() {
            let customer = self.invoker.lookup_customer(&self.email).await?;
            self.journal.record(CompletedStep {
                op: step::LOOKUP_CUSTOMER.to_string(),
                seq: 0,
                outcome: StepOutcome::Customer {
                    id: customer.as_str().to_string(),
                },
            })?;
            info!(session = %self.status.session_id, customer = %customer, "customer resolved");
            self.customer = Some(customer);
        }

        DeviceId::parse(&self.status.device_id)?;

        if self.status.tokens.unlock == 0 {
            self.post_charge(ChargeCategory::Unlock, self.tariff.unlock_tokens, 0, 0)
                .await?;
            self.transition(Phase::Active);
        }

        self.meter_deadline = Instant::now() + self.session.meter_interval;

        while !self.end_requested {
            // The gate is evaluated ahead of the race. An end request
            // latched by the previous event exits through the loop guard
            // first, and a session resumed past the threshold re-blocks
            // before the meter can charge again. Once satisfied, the
            // gate never re-triggers.
            if self.status.tokens.total >= self.session.approval_threshold && !self.gate_satisfied
            {
                self.transition(Phase::Blocked);
                info!(
                    session = %self.status.session_id,
                    total = self.status.tokens.total,
                    threshold = self.session.approval_threshold,
                    "consumption threshold reached; waiting for approval"
                );
                match self.await_gate().await {
                    GateOutcome::Approved => {
                        self.satisfy_gate()?;
                        self.transition(Phase::Active);
                    },
                    GateOutcome::EndRequested => {
                        self.end_requested = true;
                        break;
                    },
                    GateOutcome::Deadline => {
                        warn!(
                            session = %self.status.session_id,
                            "approval wait elapsed; closing session"
                        );
                        return self.close(Phase::TimedOut).await;
                    },
                }
            }

            self.drain_distance_queue().await?;
            if self.end_requested {
                break;
            }

            tokio::select! {
                () = sleep_until(self.meter_deadline) => {
                    let seq = self.next_time_seq;
                    self.next_time_seq += 1;
                    self.post_charge(ChargeCategory::Time, self.tariff.time_tokens, 0, seq)
                        .await?;
                    self.meter_deadline = Instant::now() + self.session.meter_interval;
                },
                maybe = self.inbox.recv() => {
                    match maybe {
                        Some(signal) => self.note_signal(signal)?,
                        None => {
                            warn!(
                                session = %self.status.session_id,
                                "signal channel closed; ending session"
                            );
                            self.end_requested = true;
                        },
                    }
                },
            }
        }

        self.close(Phase::Ended).await
    }

    /// Charge queued distance credits, oldest first. Stops as soon as an
    /// end request is observed; credits without a preceding unlock are
    /// dropped, never billed.
    async fn drain_distance_queue(&mut self) -> Result<(), SessionError> {
        loop {
            self.poll_signals()?;
            if self.end_requested {
                return Ok(());
            }
            let Some(feet) = self.pending_distances.pop_front() else {
                return Ok(());
            };
            if self.status.tokens.unlock == 0 {
                warn!(
                    session = %self.status.session_id,
                    "distance credit dropped: no unlock on ledger"
                );
                continue;
            }
            let seq = self.next_distance_seq;
            self.next_distance_seq += 1;
            self.post_charge(ChargeCategory::Distance, self.tariff.distance_tokens, feet, seq)
                .await?;
        }
    }

    /// Wait for the gate to open, an end request, or the deadline. Only
    /// signals are consumed here; the meter deadline stays armed and is
    /// handled by the main loop after the gate resolves.
    async fn await_gate(&mut self) -> GateOutcome {
        let deadline = Instant::now() + self.session.approval_wait;
        loop {
            tokio::select! {
                () = sleep_until(deadline) => return GateOutcome::Deadline,
                maybe = self.inbox.recv() => match maybe {
                    Some(Signal::Approve) => return GateOutcome::Approved,
                    Some(Signal::End) => return GateOutcome::EndRequested,
                    Some(Signal::Distance) => {
                        self.pending_distances.push_back(self.tariff.feet_per_increment);
                    },
                    None => return GateOutcome::EndRequested,
                },
            }
        }
    }

    /// Fold in every signal already sitting in the inbox, without
    /// waiting.
    fn poll_signals(&mut self) -> Result<(), SessionError> {
        while let Ok(signal) = self.inbox.try_recv() {
            self.note_signal(signal)?;
        }
        Ok(())
    }

    fn note_signal(&mut self, signal: Signal) -> Result<(), SessionError> {
        debug!(session = %self.status.session_id, signal = %signal, "signal received");
        match signal {
            Signal::Distance => {
                self.pending_distances
                    .push_back(self.tariff.feet_per_increment);
            },
            Signal::End => self.end_requested = true,
            Signal::Approve => self.satisfy_gate()?,
        }
        Ok(())
    }

    /// Latch the approval gate open. Idempotent; journaled once.
    fn satisfy_gate(&mut self) -> Result<(), SessionError> {
        if self.gate_satisfied {
            return Ok(());
        }
        self.gate_satisfied = true;
        self.journal.record(CompletedStep {
            op: step::GATE_APPROVED.to_string(),
            seq: 0,
            outcome: StepOutcome::Marker,
        })?;
        info!(session = %self.status.session_id, "consumption approved; gate latched open");
        Ok(())
    }

    /// Invoke one charge, journal it, and fold it into the snapshot.
    async fn post_charge(
        &mut self,
        category: ChargeCategory,
        tokens: u64,
        feet: u64,
        seq: u64,
    ) -> Result<(), SessionError> {
        let customer = self.customer.clone().ok_or_else(|| SessionError::Internal {
            reason: "charge attempted before customer resolution".to_string(),
        })?;
        self.invoker.charge(&customer, category, tokens, seq).await?;

        let at = Utc::now();
        self.journal.record(CompletedStep {
            op: BillingOp::for_category(category).as_str().to_string(),
            seq,
            outcome: StepOutcome::Charged {
                category,
                tokens,
                at,
            },
        })?;

        self.status.tokens.credit(category, tokens);
        self.status.distance_ft = self.status.distance_ft.saturating_add(feet);
        // The unlock starts the metering clock; each time charge advances it.
        if matches!(category, ChargeCategory::Unlock | ChargeCategory::Time) {
            self.status.last_meter_at = at;
        }
        self.publish();
        debug!(
            session = %self.status.session_id,
            category = category.as_str(),
            tokens,
            total = self.status.tokens.total,
            "charge posted"
        );
        Ok(())
    }

    /// Close the metering session and enter a terminal phase.
    async fn close(&mut self, terminal: Phase) -> Result<(), SessionError> {
        if let Some(customer) = self.customer.clone() {
            self.invoker.close_session(&customer).await?;
        } else {
            warn!(
                session = %self.status.session_id,
                "closing before customer resolution; nothing to settle"
            );
        }

        let ended_at = Utc::now();
        self.journal.record(CompletedStep {
            op: step::CLOSE_SESSION.to_string(),
            seq: 0,
            outcome: StepOutcome::Closed {
                phase: terminal,
                ended_at,
            },
        })?;
        self.status.ended_at = Some(ended_at);
        self.transition(terminal);
        info!(
            session = %self.status.session_id,
            phase = %terminal,
            tokens = self.status.tokens.total,
            amount_due = self.status.amount_due_minor,
            "session closed"
        );
        Ok(())
    }

    fn record_start(&mut self) -> Result<(), SessionError> {
        if self.journal.contains(step::SESSION_STARTED, 0) {
            return Ok(());
        }
        let record = StartRecord {
            session_id: self.status.session_id.clone(),
            device_id: self.status.device_id.clone(),
            email: self.email.clone(),
            pricing: self.status.pricing.clone(),
            started_at: self.status.started_at,
        };
        self.journal.record(CompletedStep {
            op: step::SESSION_STARTED.to_string(),
            seq: 0,
            outcome: StepOutcome::Started(record),
        })?;
        Ok(())
    }

    fn transition(&mut self, next: Phase) {
        let from = self.status.phase;
        debug_assert!(
            from.can_transition_to(next),
            "illegal transition {from} -> {next}"
        );
        self.status.phase = next;
        info!(session = %self.status.session_id, %from, to = %next, "phase transition");
        self.publish();
    }

    fn fail(&mut self, err: &SessionError) {
        warn!(session = %self.status.session_id, error = %err, "session failed");
        self.status.last_error = Some(err.to_string());
        self.status.ended_at = Some(Utc::now());
        self.transition(Phase::Failed);
    }

    fn publish(&mut self) {
        self.publisher.publish(&mut self.status);
    }
}
