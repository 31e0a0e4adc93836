//! Notification delivery and the hourly send ceiling

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};
use vd_error::{Result, VerdantError};

use crate::constants::notify as notify_const;
use crate::data::NotificationSettings;

/// One outgoing notification
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachment: Option<PathBuf>,
}

/// Delivers notifications
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<()>;
}

/// Outcome of a rate-limited send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Suppressed,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    count: u32,
}

/// Caps sends per channel within a rolling window
///
/// The window opens with the first send and the count resets once it has
/// elapsed. Suppressed sends are logged and never retried.
pub struct RateLimitedNotifier {
    inner: Arc<dyn Notifier>,
    channel: String,
    ceiling: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl std::fmt::Debug for RateLimitedNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedNotifier")
            .field("channel", &self.channel)
            .field("ceiling", &self.ceiling)
            .field("window", &self.window)
            .finish()
    }
}

impl RateLimitedNotifier {
    pub fn new(inner: Arc<dyn Notifier>, channel: impl Into<String>, ceiling: u32) -> Self {
        Self::with_window(inner, channel, ceiling, notify_const::WINDOW)
    }

    pub fn with_window(inner: Arc<dyn Notifier>, channel: impl Into<String>, ceiling: u32, window: Duration) -> Self {
        Self {
            inner,
            channel: channel.into(),
            ceiling,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Reserve a send slot on `channel` at `now`; false when over the ceiling
    pub fn check_at(&self, channel: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        let window = windows.entry(channel.to_string()).or_insert(Window { opened: now, count: 0 });
        if now.saturating_duration_since(window.opened) >= self.window {
            *window = Window { opened: now, count: 0 };
        }
        if window.count >= self.ceiling {
            return false;
        }
        window.count += 1;
        true
    }

    /// Sends already counted in the current window of `channel`
    pub fn sent_in_window(&self, channel: &str, now: Instant) -> u32 {
        match self.windows.lock().get(channel) {
            Some(w) if now.saturating_duration_since(w.opened) < self.window => w.count,
            _ => 0,
        }
    }

    pub fn send(&self, notification: &Notification) -> Result<SendOutcome> {
        self.send_at(notification, Instant::now())
    }

    pub fn send_at(&self, notification: &Notification, now: Instant) -> Result<SendOutcome> {
        if !self.check_at(&self.channel, now) {
            warn!(
                "NOTIFY: {} (hourly limit of {}); dropping '{}'",
                VerdantError::NotificationSuppressed { channel: self.channel.clone() },
                self.ceiling,
                notification.subject
            );
            return Ok(SendOutcome::Suppressed);
        }
        self.inner.send(notification)?;
        Ok(SendOutcome::Sent)
    }
}

/// Writes notifications to the log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            recipients = %notification.recipients.join(", "),
            "NOTIFY: {}: {}",
            notification.subject,
            notification.body
        );
        Ok(())
    }
}

/// Pipes an RFC 822 message into `sendmail -t`
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    sendmail: PathBuf,
    from: String,
}

impl SendmailNotifier {
    pub fn new(sendmail: impl Into<PathBuf>, from: impl Into<String>) -> Self {
        Self {
            sendmail: sendmail.into(),
            from: from.into(),
        }
    }

    /// Message text handed to sendmail
    pub fn render(&self, notification: &Notification) -> String {
        let mut message = format!(
            "From: {}\nTo: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}\n",
            self.from,
            notification.recipients.join(", "),
            notification.subject,
            notification.body
        );
        if let Some(path) = &notification.attachment {
            message.push_str(&format!("\nAttachment: {}\n", path.display()));
        }
        message
    }
}

impl Notifier for SendmailNotifier {
    fn send(&self, notification: &Notification) -> Result<()> {
        if notification.recipients.is_empty() {
            return Err(VerdantError::Notification("no recipients".into()));
        }
        let mut child = Command::new(&self.sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| VerdantError::Notification(format!("failed to run {}: {}", self.sendmail.display(), e)))?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(self.render(notification).as_bytes())
                .map_err(|e| VerdantError::Notification(e.to_string()))?;
        }
        let status = child.wait().map_err(|e| VerdantError::Notification(e.to_string()))?;
        if !status.success() {
            return Err(VerdantError::Notification(format!("sendmail exited with {}", status)));
        }
        Ok(())
    }
}

/// Build the rate-limited notifier described by the settings
pub fn from_settings(settings: &NotificationSettings) -> RateLimitedNotifier {
    let inner: Arc<dyn Notifier> = match &settings.sendmail_path {
        Some(path) => Arc::new(SendmailNotifier::new(path, settings.from.clone())),
        None => Arc::new(LogNotifier),
    };
    RateLimitedNotifier::new(inner, settings.channel.clone(), settings.hourly_ceiling)
}
