use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// A call participant as announced by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(default, alias = "displayName")]
    pub display_name: String,
    #[serde(default, alias = "isCreator")]
    pub is_creator: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Participant {
            id: id.into(),
            display_name: display_name.into(),
            is_creator: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// Remote participants of the current meeting, keyed by id.
///
/// Owned by the meeting session, which is the only writer.  Our own entry is
/// never stored here.
#[derive(Debug, Default)]
pub struct Roster {
    participants: BTreeMap<String, Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole roster with the list delivered by `joined`,
    /// filtering out our own id if the relay echoed it back.
    pub fn reset(&mut self, participants: Vec<Participant>, own_id: &str) {
        self.participants = participants
            .into_iter()
            .filter(|p| p.id != own_id)
            .map(|p| (p.id.clone(), p))
            .collect();
    }

    /// Insert or refresh a participant.  Returns `true` when the id was not
    /// present before.
    pub fn upsert(&mut self, participant: Participant) -> bool {
        self.participants
            .insert(participant.id.clone(), participant)
            .is_none()
    }

    /// Remove a participant by id (no-op if absent).
    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        self.participants.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Snapshot of every participant, ordered by id.
    pub fn participants(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
