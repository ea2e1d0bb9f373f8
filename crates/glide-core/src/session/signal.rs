//! External signals delivered to a running session.

/// Fire-and-forget notifications from the device and the rider.
///
/// Handlers never mutate session state; they enqueue onto the session's
/// inbox and the worker folds the signal in at its next suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The device traveled another distance increment.
    Distance,
    /// The rider ended the rental.
    End,
    /// The rider approved continued token consumption.
    Approve,
}

impl Signal {
    /// Stable signal name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Distance => "distance",
            Self::End => "end",
            Self::Approve => "approve",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}
