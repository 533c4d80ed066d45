//! Session state persisted on the client
//!
//! The session survives reloads: the participant id minted at registration,
//! the epoch it belongs to, and which questions were answered. A session
//! that cannot be decoded is discarded.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::ErrorKind,
    path::PathBuf,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Error;
use crate::participant::Id;

/// A place to keep one serialized session
pub trait LocalStorage: Send + Sync {
    /// Reads the stored session text
    fn read(&self) -> Result<Option<String>, Error>;

    /// Replaces the stored session text
    fn write(&self, contents: &str) -> Result<(), Error>;

    /// Removes the stored session
    fn clear(&self) -> Result<(), Error>;
}

/// Storage that forgets everything when dropped
#[derive(Debug, Default)]
pub struct MemoryStorage(Mutex<Option<String>>);

impl LocalStorage for MemoryStorage {
    fn read(&self) -> Result<Option<String>, Error> {
        Ok(self.0.lock().map(|stored| stored.clone()).unwrap_or_default())
    }

    fn write(&self, contents: &str) -> Result<(), Error> {
        if let Ok(mut stored) = self.0.lock() {
            *stored = Some(contents.to_owned());
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        if let Ok(mut stored) = self.0.lock() {
            *stored = None;
        }
        Ok(())
    }
}

/// Storage in a single JSON file
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Storage backed by the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LocalStorage for FileStorage {
    fn read(&self) -> Result<Option<String>, Error> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, contents: &str) -> Result<(), Error> {
        Ok(fs::write(&self.path, contents)?)
    }

    fn clear(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// What a client remembers across reloads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSession {
    /// Id sent when joining
    pub participant_id: Option<Id>,
    /// Name the participant joined with
    pub participant_name: Option<String>,
    /// Epoch the session belongs to
    pub epoch: Option<u64>,
    /// Questions this participant answered
    #[serde(default)]
    pub answered: BTreeSet<usize>,
    /// Chosen option per answered question, when known
    #[serde(default)]
    pub selected: BTreeMap<usize, i32>,
}

impl LocalSession {
    /// An empty session that belongs to `epoch`
    pub fn fresh(epoch: u64) -> Self {
        Self {
            epoch: Some(epoch),
            ..Self::default()
        }
    }

    /// Decodes the stored session
    ///
    /// # Errors
    ///
    /// Returns `Error::CorruptedLocalState` when the stored text is not a
    /// session, or the storage error.
    pub fn load(storage: &dyn LocalStorage) -> Result<Self, Error> {
        storage
            .read()?
            .map(|text| serde_json::from_str(&text).map_err(Error::CorruptedLocalState))
            .transpose()
            .map(Option::unwrap_or_default)
    }

    /// Decodes the stored session, starting over if it cannot be read
    pub fn restore(storage: &dyn LocalStorage) -> Self {
        Self::load(storage).unwrap_or_else(|e| {
            debug!(error = %e, "discarding local session");
            let _ = storage.clear();
            Self::default()
        })
    }

    /// Writes the session to `storage`
    pub fn save(&self, storage: &dyn LocalStorage) -> Result<(), Error> {
        let text = serde_json::to_string(self).map_err(Error::CorruptedLocalState)?;
        storage.write(&text)
    }

    /// Whether the participant answered `question_index`
    pub fn has_answered(&self, question_index: usize) -> bool {
        self.answered.contains(&question_index)
    }

    /// The option chosen for `question_index`, if it is known
    pub fn selected(&self, question_index: usize) -> Option<i32> {
        self.selected.get(&question_index).copied()
    }

    /// Marks `question_index` answered, with the chosen option if known
    pub fn record_answer(&mut self, question_index: usize, answer_index: Option<i32>) {
        self.answered.insert(question_index);
        if let Some(answer_index) = answer_index {
            self.selected.insert(question_index, answer_index);
        }
    }
}
