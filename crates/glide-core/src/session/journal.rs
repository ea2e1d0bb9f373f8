//! Completed-step journal.
//!
//! Models the durable host's replay guarantee: every step with an external
//! effect is recorded once it completes, and a restarted session folds the
//! journal back into its in-memory state instead of re-invoking the steps.
//! Charges are additionally keyed by stable idempotency keys, so a crash
//! between a gateway success and the journal append is absorbed on the
//! gateway side.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::CustomerRef;
use crate::ledger::{ChargeCategory, Pricing, TokenLedger};
use crate::session::state::{Phase, SessionId};

/// Step names used as journal keys. Charges reuse the billing operation
/// names so a journal line pairs with the gateway idempotency key built
/// from the same parts.
pub mod step {
    /// Session identity recorded before any external call.
    pub const SESSION_STARTED: &str = "session-started";
    /// Customer resolution during startup.
    pub const LOOKUP_CUSTOMER: &str = "lookup-customer";
    /// The one-time unlock charge.
    pub const CHARGE_UNLOCK: &str = "charge-unlock";
    /// An elapsed-time meter charge.
    pub const CHARGE_TIME: &str = "charge-time";
    /// A distance increment charge.
    pub const CHARGE_DISTANCE: &str = "charge-distance";
    /// The approval gate opened; never re-blocks afterwards.
    pub const GATE_APPROVED: &str = "gate-approved";
    /// The metering session closed into a terminal phase.
    pub const CLOSE_SESSION: &str = "close-session";
}

/// Session identity and terms, recorded as the first journal entry.
///
/// A journal that carries a start record is self-contained: a restarted
/// process can resume the session from the file alone, keeping the same
/// session id and therefore the same idempotency keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRecord {
    /// Session identifier.
    pub session_id: SessionId,

    /// Raw device identifier as supplied at start.
    pub device_id: String,

    /// Rider email used for customer lookup.
    pub email: String,

    /// Pricing terms fixed at start.
    pub pricing: Pricing,

    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
}

/// One completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedStep {
    /// Step name (see [`step`]).
    pub op: String,

    /// Sequence number within the step name.
    pub seq: u64,

    /// What the step produced.
    pub outcome: StepOutcome,
}

/// Recorded result of a completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The session started.
    Started(StartRecord),

    /// A customer account was resolved.
    Customer {
        /// Gateway customer id.
        id: String,
    },

    /// A charge was accepted by the gateway.
    Charged {
        /// Ledger category credited.
        category: ChargeCategory,
        /// Tokens consumed.
        tokens: u64,
        /// When the charge completed.
        at: DateTime<Utc>,
    },

    /// A marker with no payload.
    Marker,

    /// The session closed.
    Closed {
        /// Terminal phase recorded at close time.
        phase: Phase,
        /// When the session ended.
        ended_at: DateTime<Utc>,
    },
}

/// Journal storage errors.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// I/O error reading or appending the journal file.
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    /// A journal line failed to encode or decode.
    #[error("journal entry malformed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Append-only record of completed steps.
///
/// Implementations must persist a step before `record` returns; replay
/// correctness depends on completed steps never being lost.
pub trait CompletionJournal: Send + std::fmt::Debug {
    /// Append one completed step.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the step cannot be persisted.
    fn record(&mut self, entry: CompletedStep) -> Result<(), JournalError>;

    /// All recorded steps, in completion order.
    fn steps(&self) -> &[CompletedStep];

    /// Whether a step with the given name and sequence has completed.
    fn contains(&self, op: &str, seq: u64) -> bool {
        self.steps().iter().any(|s| s.op == op && s.seq == seq)
    }
}

/// Journal held only in memory. State is lost with the process; used in
/// tests and for sessions where replay is not required.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Vec<CompletedStep>,
}

impl MemoryJournal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompletionJournal for MemoryJournal {
    fn record(&mut self, entry: CompletedStep) -> Result<(), JournalError> {
        self.entries.push(entry);
        Ok(())
    }

    fn steps(&self) -> &[CompletedStep] {
        &self.entries
    }
}

/// Journal persisted as JSON lines, one completed step per line.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
    entries: Vec<CompletedStep>,
}

impl FileJournal {
    /// Open a journal file, loading any steps recorded by a previous run.
    /// The file is created if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the file cannot be opened or an
    /// existing line fails to decode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();

        let mut entries = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                entries.push(serde_json::from_str(&line)?);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            entries,
        })
    }

    /// Path backing this journal.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CompletionJournal for FileJournal {
    fn record(&mut self, entry: CompletedStep) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.entries.push(entry);
        Ok(())
    }

    fn steps(&self) -> &[CompletedStep] {
        &self.entries
    }
}

/// Session state reconstructed from a journal.
///
/// Folding is pure: each charge credits its category once, distance
/// charges accumulate feet, and sequence counters resume after the
/// highest recorded value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Replay {
    /// Identity recorded by a previous run.
    pub started: Option<StartRecord>,

    /// Customer resolved by a previous run.
    pub customer: Option<CustomerRef>,

    /// Whether the unlock charge completed.
    pub unlocked: bool,

    /// Ledger rebuilt from recorded charges.
    pub ledger: TokenLedger,

    /// Distance rebuilt from recorded distance charges.
    pub distance_ft: u64,

    /// Next sequence number for time charges.
    pub next_time_seq: u64,

    /// Next sequence number for distance charges.
    pub next_distance_seq: u64,

    /// Whether the approval gate was satisfied.
    pub gate_satisfied: bool,

    /// When the meter last advanced (unlock or elapsed-time charge).
    pub last_meter_at: Option<DateTime<Utc>>,

    /// Terminal phase and end time, if the session already closed.
    pub closed: Option<(Phase, DateTime<Utc>)>,
}

impl Replay {
    /// Fold a journal into the state a resuming session starts from.
    #[must_use]
    pub fn from_journal(journal: &dyn CompletionJournal, feet_per_increment: u64) -> Self {
        let mut replay = Self::default();
        for entry in journal.steps() {
            match &entry.outcome {
                StepOutcome::Started(record) => {
                    replay.started = Some(record.clone());
                },
                StepOutcome::Customer { id } => {
                    replay.customer = Some(CustomerRef::new(id.clone()));
                },
                StepOutcome::Charged {
                    category,
                    tokens,
                    at,
                } => {
                    replay.ledger.credit(*category, *tokens);
                    match category {
                        ChargeCategory::Unlock => {
                            // The unlock starts the metering clock.
                            replay.unlocked = true;
                            replay.last_meter_at = Some(*at);
                        },
                        ChargeCategory::Time => {
                            replay.next_time_seq = replay.next_time_seq.max(entry.seq + 1);
                            replay.last_meter_at = Some(*at);
                        },
                        ChargeCategory::Distance => {
                            replay.next_distance_seq =
                                replay.next_distance_seq.max(entry.seq + 1);
                            replay.distance_ft =
                                replay.distance_ft.saturating_add(feet_per_increment);
                        },
                    }
                },
                StepOutcome::Marker => {
                    if entry.op == step::GATE_APPROVED {
                        replay.gate_satisfied = true;
                    }
                },
                StepOutcome::Closed { phase, ended_at } => {
                    replay.closed = Some((*phase, *ended_at));
                },
            }
        }
        replay
    }
}
