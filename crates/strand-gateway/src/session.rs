use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle of a shard connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Identifying,
    AwaitingConfirmation,
    /// Connected; `initiating` stays true until bootstrap completes.
    Connected { initiating: bool },
    ReconnectQueued,
    WaitingToReconnect,
    Reconnecting,
    Shutdown,
}

impl Status {
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Connected { initiating: false })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Disconnected => "disconnected",
            Status::Connecting => "connecting",
            Status::Identifying => "identifying",
            Status::AwaitingConfirmation => "awaiting confirmation",
            Status::Connected { initiating: true } => "loading",
            Status::Connected { initiating: false } => "connected",
            Status::ReconnectQueued => "reconnect queued",
            Status::WaitingToReconnect => "waiting to reconnect",
            Status::Reconnecting => "reconnecting",
            Status::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// Last seen dispatch sequence. Only the read loop advances it; the heartbeat
/// task reads it.
#[derive(Debug, Default)]
pub struct SequenceCursor(AtomicU64);

impl SequenceCursor {
    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            seq => Some(seq),
        }
    }

    /// Move forward to `seq`. Returns false for a sequence behind the cursor,
    /// which is left untouched.
    pub(crate) fn advance(&self, seq: u64) -> bool {
        let current = self.0.load(Ordering::Acquire);
        if seq < current {
            return false;
        }
        self.0.store(seq, Ordering::Release);
        true
    }

    pub(crate) fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Resumable session context.
#[derive(Debug, Default)]
pub struct Session {
    pub session_id: Option<String>,
    pub sequence: Arc<SequenceCursor>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Forget the session; the next connection must identify.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.sequence.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_never_moves_backwards() {
        let cursor = SequenceCursor::default();
        assert_eq!(cursor.get(), None);
        assert!(cursor.advance(5));
        assert!(cursor.advance(5));
        assert!(!cursor.advance(3));
        assert_eq!(cursor.get(), Some(5));
        assert!(cursor.advance(9));
        assert_eq!(cursor.get(), Some(9));
    }

    #[test]
    fn invalidate_clears_resume_token() {
        let mut session = Session::new();
        session.session_id = Some("abc".into());
        session.sequence.advance(40);
        assert!(session.can_resume());

        session.invalidate();
        assert!(!session.can_resume());
        assert_eq!(session.sequence.get(), None);

        // The next session counts from the start again.
        assert!(session.sequence.advance(1));
        assert_eq!(session.sequence.get(), Some(1));
    }

    #[test]
    fn only_bootstrapped_connection_is_ready() {
        assert!(Status::Connected { initiating: false }.is_ready());
        assert!(!Status::Connected { initiating: true }.is_ready());
        assert!(!Status::Reconnecting.is_ready());
    }
}
