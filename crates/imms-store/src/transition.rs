//! The record lifecycle as one pure function.
//!
//! [`plan`] maps the current state of a record (or its absence) and a requested
//! mutation to either a [`Transition`] to apply with a single conditional write, a
//! no-op, or a [`Rejection`]. The store never branches on lifecycle rules itself.
//!
//! | current \ requested | Create          | Update(expected)                  | Delete          |
//! |---------------------|-----------------|-----------------------------------|-----------------|
//! | absent              | Active, v=1     | NotFound                          | NotFound        |
//! | Active / Reinstated | AlreadyExists   | same state, v+1 (or conflict)     | Deleted, v kept |
//! | Deleted             | AlreadyExists   | Reinstated, v+1                   | no-op           |

use serde::{Deserialize, Serialize};

use crate::change::ChangeOperation;
use crate::record::LifecycleState;

/// A mutation requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestedMutation {
    /// Create a new record.
    Create,
    /// Replace the payload of an existing record.
    Update {
        /// The version the caller last saw.
        expected_version: u64,
    },
    /// Tombstone a record.
    Delete,
}

/// Condition the conditional write must hold against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// No record exists at the ID.
    Absent,
    /// The record still has the state and version that were planned against.
    Unchanged {
        /// Observed state.
        state: LifecycleState,
        /// Observed version.
        version: u64,
    },
}

/// What happens to `deleted_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletedAtChange {
    /// Leave as is.
    Keep,
    /// Stamp with the commit time.
    Set,
    /// Remove.
    Clear,
}

/// Attribute changes a transition applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDelta {
    /// Version after the write.
    pub new_version: u64,
    /// Whether the caller's payload replaces the stored one.
    pub replace_payload: bool,
    /// Change to the tombstone timestamp.
    pub deleted_at: DeletedAtChange,
}

/// A planned lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State after the write.
    pub new_state: LifecycleState,
    /// Condition for the write.
    pub condition: WriteCondition,
    /// Attribute changes.
    pub delta: AttributeDelta,
    /// Operation reported on the change feed.
    pub operation: ChangeOperation,
}

/// Result of planning a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Apply the transition with one conditional write.
    Apply(Transition),
    /// Nothing to write; the request is already satisfied.
    NoOp,
}

/// Why a mutation cannot be planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// No record exists.
    NotFound,
    /// A record already exists at the ID being created.
    AlreadyExists {
        /// Stored version.
        actual: u64,
    },
    /// The caller's expected version is stale or ahead.
    VersionConflict {
        /// Version the caller asserted.
        expected: u64,
        /// Stored version.
        actual: u64,
    },
}

/// Plans `requested` against the current `(state, version)` of a record.
///
/// # Errors
///
/// Returns a [`Rejection`] when the mutation is illegal in the current state.
pub fn plan(
    current: Option<(LifecycleState, u64)>,
    requested: RequestedMutation,
) -> Result<Plan, Rejection> {
    use LifecycleState::{Active, Deleted, Reinstated};

    match (current, requested) {
        (None, RequestedMutation::Create) => Ok(Plan::Apply(Transition {
            new_state: Active,
            condition: WriteCondition::Absent,
            delta: AttributeDelta {
                new_version: 1,
                replace_payload: true,
                deleted_at: DeletedAtChange::Clear,
            },
            operation: ChangeOperation::Create,
        })),
        (Some((_, version)), RequestedMutation::Create) => {
            Err(Rejection::AlreadyExists { actual: version })
        }
        (None, RequestedMutation::Update { .. } | RequestedMutation::Delete) => {
            Err(Rejection::NotFound)
        }
        (Some((state @ (Active | Reinstated), version)), RequestedMutation::Update { expected_version }) => {
            if expected_version != version {
                return Err(Rejection::VersionConflict {
                    expected: expected_version,
                    actual: version,
                });
            }
            Ok(Plan::Apply(Transition {
                new_state: state,
                condition: WriteCondition::Unchanged { state, version },
                delta: AttributeDelta {
                    new_version: version + 1,
                    replace_payload: true,
                    deleted_at: DeletedAtChange::Keep,
                },
                operation: ChangeOperation::Update,
            }))
        }
        // Updating a tombstone reinstates it; the caller need not know it was deleted.
        (Some((Deleted, version)), RequestedMutation::Update { .. }) => Ok(Plan::Apply(Transition {
            new_state: Reinstated,
            condition: WriteCondition::Unchanged {
                state: Deleted,
                version,
            },
            delta: AttributeDelta {
                new_version: version + 1,
                replace_payload: true,
                deleted_at: DeletedAtChange::Clear,
            },
            operation: ChangeOperation::Update,
        })),
        (Some((state @ (Active | Reinstated), version)), RequestedMutation::Delete) => {
            Ok(Plan::Apply(Transition {
                new_state: Deleted,
                condition: WriteCondition::Unchanged { state, version },
                delta: AttributeDelta {
                    new_version: version,
                    replace_payload: false,
                    deleted_at: DeletedAtChange::Set,
                },
                operation: ChangeOperation::Delete,
            }))
        }
        (Some((Deleted, _)), RequestedMutation::Delete) => Ok(Plan::NoOp),
    }
}
