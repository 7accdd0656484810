use saga_store::Saga;

/// Result of recording one event in a saga, with the saga as stored.
#[derive(Debug, Clone, PartialEq)]
pub enum AddEventOutcome {
    /// Recorded; other event types are still missing.
    Pending(Saga),
    /// Recorded, completing the saga. The completion callback has succeeded.
    Completed(Saga),
    /// The saga had already completed; the event was not recorded.
    AlreadyCompleted(Saga),
}

impl AddEventOutcome {
    pub fn saga(&self) -> &Saga {
        match self {
            AddEventOutcome::Pending(saga)
            | AddEventOutcome::Completed(saga)
            | AddEventOutcome::AlreadyCompleted(saga) => saga,
        }
    }

    pub fn into_saga(self) -> Saga {
        match self {
            AddEventOutcome::Pending(saga)
            | AddEventOutcome::Completed(saga)
            | AddEventOutcome::AlreadyCompleted(saga) => saga,
        }
    }

    /// True only for the call that completed the saga.
    pub fn is_completed(&self) -> bool {
        matches!(self, AddEventOutcome::Completed(_))
    }

    pub fn is_already_completed(&self) -> bool {
        matches!(self, AddEventOutcome::AlreadyCompleted(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddEventOutcome::Pending(_) => "pending",
            AddEventOutcome::Completed(_) => "completed",
            AddEventOutcome::AlreadyCompleted(_) => "already_completed",
        }
    }
}
