//! User-visible notices
//!
//! The sync layer reports failures as data; whoever owns the screen decides
//! how to show them.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Severity of a notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeLevel {
    /// Neutral information
    Info,
    /// A completed action
    Success,
    /// Something degraded but recoverable
    Warning,
    /// A failed action
    Error,
}

/// One toast-style message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Severity
    pub level: NoticeLevel,
    /// Short headline
    pub title: String,
    /// Detail shown under the title
    pub message: String,
}

impl Notice {
    /// Notice at `level`
    #[must_use]
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
        }
    }

    /// Error notice
    #[must_use]
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, title, message)
    }

    /// Warning notice
    #[must_use]
    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Warning, title, message)
    }
}

/// Receives notices
pub trait Notifier: Send + Sync + fmt::Debug {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => error!(title = %notice.title, "{}", notice.message),
            NoticeLevel::Warning => warn!(title = %notice.title, "{}", notice.message),
            NoticeLevel::Info | NoticeLevel::Success => {
                info!(title = %notice.title, "{}", notice.message);
            }
        }
    }
}

/// Keeps every notice for later inspection
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl RecordingNotifier {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices received so far
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    /// Notices of one level
    #[must_use]
    pub fn with_level(&self, level: NoticeLevel) -> Vec<Notice> {
        self.notices
            .lock()
            .iter()
            .filter(|notice| notice.level == level)
            .cloned()
            .collect()
    }

    /// Forget recorded notices
    pub fn clear(&self) {
        self.notices.lock().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}
