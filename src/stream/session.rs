//! Resume state carried across physical connections.
//!
//! `TransportSession` remembers what is needed to replay the logical request
//! after an interruption: the server-assigned conversation, the last
//! processed position and the outbound payload.

use tracing::debug;

use crate::stream::proto::{StreamEvent, StreamRequest};

/// Outbound payload stored for replay on reconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub prompt: String,
    pub resume_path: Option<String>,
}

/// Ephemeral per-transport session state. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportSession {
    conversation_id: Option<String>,
    last_seen_position: Option<String>,
    reconnect_attempts: u32,
    last_request: Option<PendingRequest>,
}

impl TransportSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Id of the most recent non-heartbeat event that carried one.
    pub fn last_seen_position(&self) -> Option<&str> {
        self.last_seen_position.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_request(&self) -> Option<&PendingRequest> {
        self.last_request.as_ref()
    }

    pub fn set_conversation_id(&mut self, conversation_id: impl Into<String>) {
        self.conversation_id = Some(conversation_id.into());
    }

    /// Forgets the conversation, cursor and attempt counter.
    ///
    /// The stored request is kept so an active stream can still be resumed.
    pub fn clear_conversation(&mut self) {
        self.conversation_id = None;
        self.last_seen_position = None;
        self.reconnect_attempts = 0;
    }

    /// Starts a new logical send.
    pub(crate) fn begin_send(&mut self, prompt: String, resume_path: Option<String>) {
        self.reconnect_attempts = 0;
        self.last_request = Some(PendingRequest {
            prompt,
            resume_path,
        });
    }

    pub(crate) fn record_reconnect_attempt(&mut self) -> u32 {
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.reconnect_attempts
    }

    pub(crate) fn reset_reconnect_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }

    /// Applies a delivered event to the resume state.
    ///
    /// Heartbeats never move the cursor. A conversation id is only adopted
    /// when none is known yet.
    pub(crate) fn observe(&mut self, event: &StreamEvent) {
        if let Some(announced) = event.conversation_id.as_deref() {
            match self.conversation_id.as_deref() {
                None => self.conversation_id = Some(announced.to_string()),
                Some(current) if current != announced => {
                    debug!(
                        event = "conversation_id_change_ignored",
                        current, announced
                    );
                }
                Some(_) => {}
            }
        }

        if event.is_heartbeat() {
            return;
        }
        if let Some(id) = event.id.as_deref() {
            self.last_seen_position = Some(id.to_string());
        }
    }

    /// Builds the outbound body for the stored request.
    ///
    /// Returns `None` until something has been sent.
    pub(crate) fn request(&self, resume: bool) -> Option<StreamRequest> {
        let pending = self.last_request.as_ref()?;
        Some(StreamRequest {
            prompt: pending.prompt.clone(),
            conversation_id: self.conversation_id.clone(),
            resume_path: pending.resume_path.clone(),
            cursor: self.last_seen_position.clone(),
            resume,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::TransportSession;
    use crate::stream::proto::{EventKind, StreamEvent};

    fn event(id: Option<&str>, kind: EventKind, conversation_id: Option<&str>) -> StreamEvent {
        StreamEvent {
            id: id.map(str::to_string),
            kind,
            payload: Value::Null,
            emitted_at: None,
            conversation_id: conversation_id.map(str::to_string),
        }
    }

    #[test]
    fn request_is_none_before_first_send() {
        let session = TransportSession::new();
        assert!(session.request(false).is_none());
    }

    #[test]
    fn cursor_follows_non_heartbeat_events() {
        let mut session = TransportSession::new();
        session.begin_send("hi".to_string(), None);
        session.observe(&event(Some("1"), EventKind::Answer, None));
        session.observe(&event(Some("2"), EventKind::Heartbeat, None));
        session.observe(&event(None, EventKind::Status, None));
        assert_eq!(session.last_seen_position(), Some("1"));

        let request = session.request(true).expect("request");
        assert_eq!(request.cursor.as_deref(), Some("1"));
        assert!(request.resume);
        assert_eq!(request.prompt, "hi");
    }

    #[test]
    fn first_conversation_id_wins() {
        let mut session = TransportSession::new();
        session.observe(&event(None, EventKind::Status, Some("conv-a")));
        session.observe(&event(None, EventKind::Status, Some("conv-b")));
        assert_eq!(session.conversation_id(), Some("conv-a"));
    }

    #[test]
    fn clear_conversation_resets_resume_state_but_keeps_request() {
        let mut session = TransportSession::new();
        session.begin_send("hi".to_string(), Some("/docs".to_string()));
        session.set_conversation_id("conv-a");
        session.observe(&event(Some("4"), EventKind::Answer, None));
        session.record_reconnect_attempt();

        session.clear_conversation();

        assert_eq!(session.conversation_id(), None);
        assert_eq!(session.last_seen_position(), None);
        assert_eq!(session.reconnect_attempts(), 0);
        let request = session.request(false).expect("request kept");
        assert_eq!(request.resume_path.as_deref(), Some("/docs"));
        assert_eq!(request.conversation_id, None);
        assert_eq!(request.cursor, None);
    }

    #[test]
    fn begin_send_resets_attempts() {
        let mut session = TransportSession::new();
        session.record_reconnect_attempt();
        session.record_reconnect_attempt();
        assert_eq!(session.reconnect_attempts(), 2);
        session.begin_send("again".to_string(), None);
        assert_eq!(session.reconnect_attempts(), 0);
    }
}
