//! Dead-letter stores.
//!
//! Messages land here after exhausting transport retries. Insertion is
//! keyed by message id, so a message is stored at most once.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: Message, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            message,
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

pub trait DeadLetterStore: Send + Sync {
    /// Store a letter. Returns false when the message id is already present.
    fn insert(&self, letter: DeadLetter) -> Result<bool>;

    fn list(&self) -> Result<Vec<DeadLetter>>;

    fn contains(&self, message_id: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeadLetterStore for InMemoryDeadLetters {
    fn insert(&self, letter: DeadLetter) -> Result<bool> {
        let mut letters = self.letters.lock();
        if letters.iter().any(|l| l.message.id == letter.message.id) {
            return Ok(false);
        }
        letters.push(letter);
        Ok(true)
    }

    fn list(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.letters.lock().clone())
    }

    fn contains(&self, message_id: &str) -> bool {
        self.letters.lock().iter().any(|l| l.message.id == message_id)
    }

    fn len(&self) -> usize {
        self.letters.lock().len()
    }
}

/// Append-only JSONL file, one dead letter per line.
pub struct JsonlDeadLetters {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

struct JsonlState {
    ids: HashSet<String>,
    writer: BufWriter<File>,
}

impl JsonlDeadLetters {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut ids = HashSet::new();
        if path.exists() {
            for letter in read_letters(&path)? {
                ids.insert(letter.message.id);
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::debug!("Opened dead-letter store at {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(JsonlState {
                ids,
                writer: BufWriter::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeadLetterStore for JsonlDeadLetters {
    fn insert(&self, letter: DeadLetter) -> Result<bool> {
        let mut state = self.state.lock();
        if state.ids.contains(&letter.message.id) {
            return Ok(false);
        }

        let line = serde_json::to_string(&letter)?;
        writeln!(state.writer, "{}", line)?;
        state.writer.flush()?;

        state.ids.insert(letter.message.id);
        Ok(true)
    }

    fn list(&self) -> Result<Vec<DeadLetter>> {
        // Hold the lock so a concurrent append is not read half-written.
        let _state = self.state.lock();
        read_letters(&self.path)
    }

    fn contains(&self, message_id: &str) -> bool {
        self.state.lock().ids.contains(message_id)
    }

    fn len(&self) -> usize {
        self.state.lock().ids.len()
    }
}

fn read_letters(path: &Path) -> Result<Vec<DeadLetter>> {
    let reader = BufReader::new(File::open(path)?);
    let mut letters = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DeadLetter>(&line) {
            Ok(letter) => letters.push(letter),
            Err(e) => tracing::warn!("Skipping malformed dead letter in {}: {}", path.display(), e),
        }
    }
    Ok(letters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;
    use serde_json::json;

    fn letter() -> DeadLetter {
        let message = Message::new(EventType::TaskRequest, "engine", json!({})).to("coder");
        DeadLetter::new(message, "socket write failed", 3)
    }

    #[test]
    fn test_in_memory_exactly_once() {
        let store = InMemoryDeadLetters::new();
        let l = letter();
        assert!(store.insert(l.clone()).unwrap());
        assert!(!store.insert(l.clone()).unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.contains(&l.message.id));
    }

    #[test]
    fn test_jsonl_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead").join("letters.jsonl");
        let l = letter();

        {
            let store = JsonlDeadLetters::open(&path).unwrap();
            assert!(store.insert(l.clone()).unwrap());
            assert!(!store.insert(l.clone()).unwrap());
        }

        let reopened = JsonlDeadLetters::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(!reopened.insert(l.clone()).unwrap());

        let listed = reopened.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].attempts, 3);
        assert_eq!(listed[0].message.id, l.message.id);
    }
}
