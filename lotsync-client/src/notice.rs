//! User-facing notices
//!
//! Components never render anything themselves. They publish a [`Notice`]
//! and whatever UI sits on top decides how to show it.

use lotsync_core::{Error, ErrorClass};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Follow-up the UI should offer alongside a notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeAction {
    /// Manual refresh / retry
    Refresh,
    /// Send the user back to the sign-in screen
    SignIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
            action: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
            action: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: NoticeAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Error notice with the action matching the error's class
    pub fn from_error(error: &Error) -> Self {
        let notice = Self::error(error.user_message());
        match error.class() {
            ErrorClass::Auth => notice.with_action(NoticeAction::SignIn),
            ErrorClass::Transient | ErrorClass::Timeout => notice.with_action(NoticeAction::Refresh),
            ErrorClass::Rejected | ErrorClass::Validation => notice,
        }
    }
}

/// Broadcast hub for notices; cloning shares the same channel
#[derive(Clone)]
pub struct Notices {
    tx: broadcast::Sender<Notice>,
}

impl Notices {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Publish a notice; dropped silently when nobody listens
    pub fn publish(&self, notice: Notice) {
        tracing::debug!(level = ?notice.level, message = %notice.message, "notice");
        let _ = self.tx.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

impl Default for Notices {
    fn default() -> Self {
        Self::new()
    }
}
