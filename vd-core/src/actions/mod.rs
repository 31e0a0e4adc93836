//! Action dispatch
//!
//! Runs a controller's ordered action chain. Each action sees the message
//! built so far; a failing action leaves an error marker and the chain moves
//! on. Email actions only collect recipients and one email goes out after
//! the chain, through the hourly limiter.

mod notes;
mod pipeline;

use std::path::PathBuf;

use vd_error::Result;

use crate::notify::SendOutcome;

pub use notes::{JsonlNoteStore, MemoryNoteStore, NoteStore};
pub use pipeline::ActionPipeline;

/// Runtime command for a PID controller
#[derive(Debug, Clone, PartialEq)]
pub enum PidCommand {
    Pause,
    Resume,
    /// Hold the current output, stop regulating until resumed
    Hold,
    SetSetpoint(f64),
    RaiseSetpoint(f64),
    LowerSetpoint(f64),
    SetMethod(Option<String>),
}

/// Request for the supervisor, posted without waiting for it to be handled
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Activate(String),
    Deactivate(String),
    Pid { pid_id: String, command: PidCommand },
}

/// Where actions post controller requests
#[cfg_attr(test, mockall::automock)]
pub trait ControllerControl: Send + Sync {
    /// Queue a request; must not block on the target loop
    fn post(&self, request: ControlRequest) -> Result<()>;
}

/// State threaded through one chain execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainContext {
    pub message: String,
    pub note_tags: Vec<String>,
    pub email_recipients: Vec<String>,
    pub attachment: Option<PathBuf>,
}

impl ChainContext {
    pub fn new(initial_message: impl Into<String>) -> Self {
        Self {
            message: initial_message.into(),
            ..Self::default()
        }
    }

    /// Append a sentence to the message
    pub fn append(&mut self, text: &str) {
        if !self.message.is_empty() && !self.message.ends_with(char::is_whitespace) {
            self.message.push(' ');
        }
        self.message.push_str(text);
    }

    pub fn add_recipients(&mut self, recipients: &[String]) {
        for r in recipients {
            if !self.email_recipients.contains(r) {
                self.email_recipients.push(r.clone());
            }
        }
    }
}

/// Result of a chain execution
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub message: String,
    pub note_tags: Vec<String>,
    pub email_recipients: Vec<String>,
    pub attachment: Option<PathBuf>,
    /// (action id, error) for every failed action
    pub errors: Vec<(String, String)>,
    /// Outcome of the single email, if one was due
    pub email: Option<SendOutcome>,
}
