//! Durable key-value storage for quiz data
//!
//! The engine persists every mutation before acknowledging it. Any backend
//! that can get, put and delete small values by key is enough; this module
//! provides an in-memory store and a file-per-key store.
//!
//! Keys used by the engine:
//!
//! * `quiz-state` - the [`QuizState`](crate::step::QuizState) singleton
//! * `questions` - the ordered [`QuestionSet`](crate::question::QuestionSet)
//! * `participants` - the [`Roster`](crate::participant::Roster)
//! * `answers/{questionIndex}` - the answer set of one question
//! * `revealed` - question indices whose answers have been scored

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Key of the quiz state singleton
pub const QUIZ_STATE: &str = "quiz-state";
/// Key of the question list
pub const QUESTIONS: &str = "questions";
/// Key of the participant roster
pub const PARTICIPANTS: &str = "participants";
/// Key of the revealed question set
pub const REVEALED: &str = "revealed";
/// Prefix shared by every answer set key
pub const ANSWERS_PREFIX: &str = "answers/";

/// Key of the answer set for `question_index`
pub fn answers_key(question_index: usize) -> String {
    format!("{ANSWERS_PREFIX}{question_index}")
}

/// Errors raised by storage backends
#[derive(Error, Debug)]
pub enum Error {
    /// The backend failed to read or write
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// A stored value could not be encoded or decoded
    #[error("stored value is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A lock inside the backend was poisoned by a panicking writer
    #[error("storage lock poisoned")]
    Poisoned,
}

/// A durable key-value store
///
/// `put` must not return before the value would survive a restart.
pub trait Store: Send + Sync {
    /// Reads the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Stores `value` under `key`, replacing any previous value
    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Removes `key` if present
    fn delete(&self, key: &str) -> Result<(), Error>;

    /// Lists the keys starting with `prefix`
    fn keys(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// Reads and decodes a JSON value
///
/// # Errors
///
/// Returns the backend error, or `Error::Malformed` if the bytes are not
/// valid JSON for `T`.
pub fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>, Error> {
    store
        .get(key)?
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()
        .map_err(Error::from)
}

/// Encodes and stores a JSON value
///
/// # Errors
///
/// Returns the backend error if the write fails.
pub fn save<T: Serialize + ?Sized>(store: &dyn Store, key: &str, value: &T) -> Result<(), Error> {
    store.put(key, &serde_json::to_vec(value)?)
}

/// A store that lives only as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let values = self.values.read().map_err(|_| Error::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut values = self.values.write().map_err(|_| Error::Poisoned)?;
        values.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        let mut values = self.values.write().map_err(|_| Error::Poisoned)?;
        values.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let values = self.values.read().map_err(|_| Error::Poisoned)?;
        Ok(values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// A store keeping one JSON file per key in a directory
///
/// Writes go to a temporary file that is synced and renamed over the
/// target, so a crash leaves either the old or the new value.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `dir`
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key.replace('/', ".")))
    }

    fn key_of(file_name: &str) -> Option<String> {
        file_name
            .strip_suffix(".json")
            .map(|stem| match stem.strip_prefix("answers.") {
                Some(index) => format!("{ANSWERS_PREFIX}{index}"),
                None => stem.to_owned(),
            })
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let target = self.path(key);
        let temporary = target.with_extension("json.tmp");
        let mut file = fs::File::create(&temporary)?;
        file.write_all(value)?;
        file.sync_all()?;
        fs::rename(&temporary, &target)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        match fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(Self::key_of) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn exercise(store: &dyn Store) {
        assert!(store.get(QUIZ_STATE).unwrap().is_none());
        save(store, QUIZ_STATE, &vec![1, 2, 3]).unwrap();
        save(store, &answers_key(0), &"zero").unwrap();
        save(store, &answers_key(12), &"twelve").unwrap();

        let loaded: Option<Vec<i32>> = load(store, QUIZ_STATE).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));

        let mut keys = store.keys(ANSWERS_PREFIX).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["answers/0".to_owned(), "answers/12".to_owned()]);

        store.delete(&answers_key(0)).unwrap();
        store.delete(&answers_key(0)).unwrap();
        assert_eq!(store.keys(ANSWERS_PREFIX).unwrap().len(), 1);
    }

    #[test]
    fn memory_store() {
        exercise(&MemoryStore::default());
    }

    #[test]
    fn file_store() {
        let dir = std::env::temp_dir().join(format!("quizsync-store-{}", uuid::Uuid::new_v4()));
        exercise(&FileStore::open(&dir).unwrap());

        let reopened = FileStore::open(&dir).unwrap();
        let loaded: Option<String> = load(&reopened, &answers_key(12)).unwrap();
        assert_eq!(loaded.as_deref(), Some("twelve"));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn malformed_values_are_reported() {
        let store = MemoryStore::default();
        store.put(QUESTIONS, b"{not json").unwrap();
        let loaded: Result<Option<Vec<String>>, _> = load(&store, QUESTIONS);
        assert!(matches!(loaded, Err(Error::Malformed(_))));
    }
}
