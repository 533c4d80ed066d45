//! Participants and the round's roster
//!
//! Participants identify themselves with a client-generated [`Id`] so they
//! can re-register after a page reload without creating a second entry.
//! The [`Roster`] keeps them in join order and applies the name policy.

use std::{collections::HashMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay, skip_serializing_none};
use thiserror::Error;
use uuid::Uuid;

/// A unique identifier for a participant
///
/// The id is minted by the client and persisted locally, which is what makes
/// joining refresh-safe.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct Id(Uuid);

impl Id {
    /// Creates a new random participant ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Id {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// A player in the current round
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Client-generated identity
    pub id: Id,
    /// Display name after trimming and filtering
    pub name: String,
    /// Total score over all revealed questions
    pub score: u64,
    /// Avatar supplied by the identity collaborator
    pub avatar_url: Option<String>,
}

/// Errors that can occur when registering a participant
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Error {
    /// The name is empty or contains only whitespace
    #[error("name cannot be empty")]
    Empty,
    /// The name contains inappropriate content
    #[error("name is inappropriate")]
    Sinful,
    /// The name exceeds the maximum allowed length
    #[error("name is too long")]
    TooLong,
    /// The round has reached the maximum number of participants
    #[error("maximum number of participants reached")]
    MaximumParticipants,
}

/// Checks a requested name against the naming policy
///
/// # Returns
///
/// The trimmed name that should be stored.
///
/// # Errors
///
/// * `Error::TooLong` - Name exceeds the byte limit
/// * `Error::Empty` - Name is empty after trimming whitespace
/// * `Error::Sinful` - Name contains inappropriate content
pub fn clean_name(name: &str) -> Result<String, Error> {
    use rustrict::CensorStr;

    if name.len() > crate::constants::participant::MAX_NAME_LENGTH {
        return Err(Error::TooLong);
    }
    let name = rustrict::trim_whitespace(name);
    if name.is_empty() {
        return Err(Error::Empty);
    }
    if name.is_inappropriate() {
        return Err(Error::Sinful);
    }
    Ok(name.to_owned())
}

/// Result of a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Joined {
    /// A new participant was created
    New(Participant),
    /// The id was already registered; the stored record is returned unchanged
    Existing(Participant),
}

impl Joined {
    /// The participant record regardless of whether it was new
    pub fn participant(&self) -> &Participant {
        match self {
            Self::New(p) | Self::Existing(p) => p,
        }
    }
}

/// Serialization helper for Roster
#[derive(Deserialize)]
struct RosterSerde {
    participants: Vec<Participant>,
}

/// The participants of the current round in join order
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(from = "RosterSerde")]
pub struct Roster {
    participants: Vec<Participant>,

    /// Position of each participant in `participants`
    #[serde(skip_serializing)]
    index: HashMap<Id, usize>,
}

impl From<RosterSerde> for Roster {
    /// Rebuilds the id index, which is not serialized
    fn from(serde: RosterSerde) -> Self {
        let RosterSerde { participants } = serde;
        let index = participants
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, i))
            .collect();
        Self {
            participants,
            index,
        }
    }
}

impl Roster {
    /// Registers a participant, or returns the existing record for `id`
    ///
    /// Re-registration never changes the stored name or score, so a client
    /// that reloads and joins again sees the same record.
    ///
    /// # Errors
    ///
    /// Returns a name policy error, or `Error::MaximumParticipants` when the
    /// round is full. Neither applies to an id that is already registered.
    pub fn join(&mut self, id: Id, name: &str, avatar_url: Option<String>) -> Result<Joined, Error> {
        if let Some(existing) = self.get(id) {
            return Ok(Joined::Existing(existing.clone()));
        }
        if self.participants.len() >= crate::constants::quiz::MAX_PARTICIPANT_COUNT {
            return Err(Error::MaximumParticipants);
        }
        let participant = Participant {
            id,
            name: clean_name(name)?,
            score: 0,
            avatar_url,
        };
        self.index.insert(id, self.participants.len());
        self.participants.push(participant.clone());
        Ok(Joined::New(participant))
    }

    /// Looks up a participant by id
    pub fn get(&self, id: Id) -> Option<&Participant> {
        self.index.get(&id).and_then(|i| self.participants.get(*i))
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: Id) -> bool {
        self.index.contains_key(&id)
    }

    /// Overwrites the score of every participant found in `scores`
    ///
    /// Participants missing from `scores` are set to zero, since scores are
    /// always recomputed from the complete answer history.
    pub fn set_scores(&mut self, scores: &HashMap<Id, u64>) {
        for participant in &mut self.participants {
            participant.score = scores.get(&participant.id).copied().unwrap_or(0);
        }
    }

    /// All participants in join order
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Number of registered participants
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Whether nobody has joined
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Removes every participant
    pub fn clear(&mut self) {
        self.participants.clear();
        self.index.clear();
    }
}
