//! Single transient notification banner.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Failure,
}

/// A user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

/// Holds at most one notice; a new one replaces the old and each expires
/// after `duration`.
#[derive(Debug)]
pub struct Notifier {
    current: Option<(Notice, Instant)>,
    duration: Duration,
}

impl Notifier {
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self {
            current: None,
            duration,
        }
    }

    pub fn success(&mut self, message: impl Into<String>, now: Instant) {
        self.show(NoticeKind::Success, message.into(), now);
    }

    pub fn failure(&mut self, message: impl Into<String>, now: Instant) {
        self.show(NoticeKind::Failure, message.into(), now);
    }

    fn show(&mut self, kind: NoticeKind, message: String, now: Instant) {
        tracing::debug!(?kind, message = %message, "notice");
        self.current = Some((Notice { kind, message }, now + self.duration));
    }

    #[must_use]
    pub fn current(&self) -> Option<&Notice> {
        self.current.as_ref().map(|(notice, _)| notice)
    }

    /// When the current notice expires.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().map(|(_, deadline)| *deadline)
    }

    /// Drop the notice if it has expired. Returns `true` if one was dropped.
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.deadline().is_some_and(|deadline| deadline <= now) {
            self.current = None;
            return true;
        }
        false
    }

    /// Drop the notice immediately.
    pub fn dismiss(&mut self) -> bool {
        self.current.take().is_some()
    }
}
