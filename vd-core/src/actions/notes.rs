//! Note storage for "create note" actions

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::debug;
use vd_error::{Result, VerdantError};

use crate::data::Note;

pub trait NoteStore: Send + Sync {
    fn add(&self, note: Note) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryNoteStore {
    notes: Mutex<Vec<Note>>,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(&self) -> Vec<Note> {
        self.notes.lock().clone()
    }
}

impl NoteStore for MemoryNoteStore {
    fn add(&self, note: Note) -> Result<()> {
        self.notes.lock().push(note);
        Ok(())
    }
}

/// Appends one JSON document per line
#[derive(Debug)]
pub struct JsonlNoteStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlNoteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl NoteStore for JsonlNoteStore {
    fn add(&self, note: Note) -> Result<()> {
        let line = serde_json::to_string(&note)?;
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| VerdantError::FileWrite { path: self.path.clone(), source: e })?;
        writeln!(file, "{}", line).map_err(|e| VerdantError::FileWrite { path: self.path.clone(), source: e })?;
        debug!("Stored note {} in {:?}", note.id, self.path);
        Ok(())
    }
}
