use gemchat_common::{Error, Gem, Message, MessageId, MessageStatus, Role};

/// Reply text shown when the provider rejected or never received a credential.
pub const AUTH_FAILURE_TEXT: &str = "Connection failed — check API key";

/// Reply text shown for every other failed generation.
pub const STREAM_FAILURE_TEXT: &str =
    "Something went wrong while generating a response. Please try again.";

/// Appended to the outgoing prompt (never to the stored message) in voice mode.
pub const VOICE_MODE_SUFFIX: &str =
    " [SYSTEM INSTRUCTION: VOICE MODE ACTIVE. Respond using short, spoken-style sentences.]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    Stream,
}

impl FailureKind {
    pub fn of(error: &Error) -> Self {
        if error.is_auth() {
            FailureKind::Auth
        } else {
            FailureKind::Stream
        }
    }

    /// Text the failed reply is finalized with.
    pub fn reply_text(self) -> &'static str {
        match self {
            FailureKind::Auth => AUTH_FAILURE_TEXT,
            FailureKind::Stream => STREAM_FAILURE_TEXT,
        }
    }
}

/// Where the session is in its current (or last) generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationPhase {
    Idle,
    AwaitingFirstToken {
        user_id: MessageId,
        message_id: MessageId,
    },
    Streaming {
        user_id: MessageId,
        message_id: MessageId,
    },
    Settled {
        message_id: MessageId,
    },
    Failed {
        message_id: MessageId,
        kind: FailureKind,
    },
}

impl GenerationPhase {
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            GenerationPhase::AwaitingFirstToken { .. } | GenerationPhase::Streaming { .. }
        )
    }

    /// `(user message, model reply)` of the generation in flight.
    pub fn in_flight_ids(&self) -> Option<(&MessageId, &MessageId)> {
        match self {
            GenerationPhase::AwaitingFirstToken {
                user_id,
                message_id,
            }
            | GenerationPhase::Streaming {
                user_id,
                message_id,
            } => Some((user_id, message_id)),
            _ => None,
        }
    }
}

/// A state change of one persona session.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Append the user's message and an empty model reply.
    Submit { user: Message, placeholder: Message },
    /// Append text to the reply in flight.
    Fragment { message_id: MessageId, text: String },
    Settle { message_id: MessageId },
    Fail { message_id: MessageId, kind: FailureKind },
    /// Drop the generation in flight along with the message that started it.
    Discard { message_id: MessageId },
    DismissCredentialPrompt,
    SetVoiceMode(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("message is empty")]
    EmptyInput,

    #[error("a reply is already being generated")]
    Busy,

    #[error("message {0} is not being generated")]
    NotInFlight(MessageId),
}

/// The complete state of one open persona session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub gem: Gem,
    pub history: Vec<Message>,
    pub phase: GenerationPhase,
    pub needs_credential: bool,
    pub voice_mode: bool,
}

impl SessionSnapshot {
    /// Start a session from stored history. Anything stored mid-stream can no
    /// longer finish and is marked failed.
    pub fn new(gem: Gem, mut history: Vec<Message>) -> Self {
        for message in history.iter_mut().filter(|m| m.is_streaming()) {
            message.status = MessageStatus::Failed;
            if message.content.is_empty() {
                message.content = STREAM_FAILURE_TEXT.to_string();
            }
        }

        Self {
            gem,
            history,
            phase: GenerationPhase::Idle,
            needs_credential: false,
            voice_mode: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.phase.is_in_flight()
    }

    pub fn streaming_count(&self) -> usize {
        self.history.iter().filter(|m| m.is_streaming()).count()
    }

    /// The prompt actually sent upstream for `text`.
    pub fn outgoing_text(&self, text: &str) -> String {
        if self.voice_mode {
            format!("{text}{VOICE_MODE_SUFFIX}")
        } else {
            text.to_string()
        }
    }

    /// Compute the state after `transition` without touching `self`.
    pub fn apply(&self, transition: &Transition) -> Result<SessionSnapshot, TransitionError> {
        let mut next = self.clone();

        match transition {
            Transition::Submit { user, placeholder } => {
                if user.content.trim().is_empty() {
                    return Err(TransitionError::EmptyInput);
                }
                if self.is_busy() {
                    return Err(TransitionError::Busy);
                }
                debug_assert_eq!(user.role, Role::User);
                debug_assert!(placeholder.is_streaming());

                next.history.push(user.clone());
                next.history.push(placeholder.clone());
                next.needs_credential = false;
                next.phase = GenerationPhase::AwaitingFirstToken {
                    user_id: user.id.clone(),
                    message_id: placeholder.id.clone(),
                };
            }
            Transition::Fragment { message_id, text } => {
                let user_id = self.in_flight_user(message_id)?.clone();
                let reply = next.reply_mut(message_id)?;
                reply.content.push_str(text);
                reply.status = MessageStatus::Streaming;
                next.phase = GenerationPhase::Streaming {
                    user_id,
                    message_id: message_id.clone(),
                };
            }
            Transition::Settle { message_id } => {
                self.in_flight_user(message_id)?;
                next.reply_mut(message_id)?.status = MessageStatus::Settled;
                next.phase = GenerationPhase::Settled {
                    message_id: message_id.clone(),
                };
            }
            Transition::Fail { message_id, kind } => {
                self.in_flight_user(message_id)?;
                let reply = next.reply_mut(message_id)?;
                reply.content = kind.reply_text().to_string();
                reply.status = MessageStatus::Failed;
                next.needs_credential = *kind == FailureKind::Auth;
                next.phase = GenerationPhase::Failed {
                    message_id: message_id.clone(),
                    kind: *kind,
                };
            }
            Transition::Discard { message_id } => {
                let user_id = self.in_flight_user(message_id)?;
                next.history.retain(|m| &m.id != user_id && &m.id != message_id);
                next.phase = GenerationPhase::Idle;
            }
            Transition::DismissCredentialPrompt => next.needs_credential = false,
            Transition::SetVoiceMode(on) => next.voice_mode = *on,
        }

        Ok(next)
    }

    fn in_flight_user(&self, message_id: &MessageId) -> Result<&MessageId, TransitionError> {
        match self.phase.in_flight_ids() {
            Some((user_id, current)) if current == message_id => Ok(user_id),
            _ => Err(TransitionError::NotInFlight(message_id.clone())),
        }
    }

    fn reply_mut(&mut self, message_id: &MessageId) -> Result<&mut Message, TransitionError> {
        self.history
            .iter_mut()
            .rev()
            .find(|m| &m.id == message_id)
            .ok_or_else(|| TransitionError::NotInFlight(message_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemchat_common::{GemIcon, GemId};

    fn gem() -> Gem {
        Gem {
            id: GemId::new("tester"),
            name: "Tester".to_string(),
            description: "Checks things".to_string(),
            icon: GemIcon::Code,
            color: "sky".to_string(),
            system_instruction: "Be precise.".to_string(),
            starter_prompts: vec!["Go".to_string()],
        }
    }

    fn submitted(text: &str) -> (SessionSnapshot, MessageId) {
        let placeholder = Message::placeholder();
        let id = placeholder.id.clone();
        let snapshot = SessionSnapshot::new(gem(), Vec::new())
            .apply(&Transition::Submit {
                user: Message::user(text),
                placeholder,
            })
            .unwrap();
        (snapshot, id)
    }

    #[test]
    fn submit_appends_user_and_placeholder() {
        let (snapshot, id) = submitted("hello");

        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.history[0].role, Role::User);
        assert_eq!(snapshot.history[1].id, id);
        assert!(snapshot.history[1].content.is_empty());
        assert!(snapshot.is_busy());
        assert_eq!(snapshot.streaming_count(), 1);
    }

    #[test]
    fn submit_rejects_blank_text_and_busy_session() {
        let idle = SessionSnapshot::new(gem(), Vec::new());
        for text in ["", "   ", "\n\t"] {
            let result = idle.apply(&Transition::Submit {
                user: Message::user(text),
                placeholder: Message::placeholder(),
            });
            assert_eq!(result.unwrap_err(), TransitionError::EmptyInput);
        }

        let (busy, _) = submitted("first");
        let result = busy.apply(&Transition::Submit {
            user: Message::user("second"),
            placeholder: Message::placeholder(),
        });
        assert_eq!(result.unwrap_err(), TransitionError::Busy);
    }

    #[test]
    fn fragments_append_in_order_then_settle() {
        let (mut snapshot, id) = submitted("count");
        for text in ["one", " two", " three"] {
            snapshot = snapshot
                .apply(&Transition::Fragment {
                    message_id: id.clone(),
                    text: text.to_string(),
                })
                .unwrap();
            assert_eq!(snapshot.streaming_count(), 1);
            assert!(matches!(snapshot.phase, GenerationPhase::Streaming { .. }));
        }

        let settled = snapshot
            .apply(&Transition::Settle {
                message_id: id.clone(),
            })
            .unwrap();
        assert_eq!(settled.history[1].content, "one two three");
        assert_eq!(settled.history[1].status, MessageStatus::Settled);
        assert_eq!(settled.streaming_count(), 0);
        assert!(!settled.is_busy());
    }

    #[test]
    fn auth_failure_raises_credential_indicator() {
        let (snapshot, id) = submitted("hi");
        let failed = snapshot
            .apply(&Transition::Fail {
                message_id: id,
                kind: FailureKind::Auth,
            })
            .unwrap();

        assert_eq!(failed.history[1].content, AUTH_FAILURE_TEXT);
        assert_eq!(failed.history[1].status, MessageStatus::Failed);
        assert!(failed.needs_credential);
        assert!(!failed.is_busy());
    }

    #[test]
    fn stream_failure_replaces_partial_content() {
        let (snapshot, id) = submitted("hi");
        let failed = snapshot
            .apply(&Transition::Fragment {
                message_id: id.clone(),
                text: "partial".to_string(),
            })
            .and_then(|s| {
                s.apply(&Transition::Fail {
                    message_id: id,
                    kind: FailureKind::Stream,
                })
            })
            .unwrap();

        assert_eq!(failed.history[1].content, STREAM_FAILURE_TEXT);
        assert!(!failed.needs_credential);
    }

    #[test]
    fn next_submit_clears_credential_indicator() {
        let (snapshot, id) = submitted("hi");
        let failed = snapshot
            .apply(&Transition::Fail {
                message_id: id,
                kind: FailureKind::Auth,
            })
            .unwrap();

        let retried = failed
            .apply(&Transition::Submit {
                user: Message::user("again"),
                placeholder: Message::placeholder(),
            })
            .unwrap();
        assert!(!retried.needs_credential);
        assert_eq!(retried.history.len(), 4);
    }

    #[test]
    fn discard_restores_committed_history() {
        let before = SessionSnapshot::new(gem(), vec![Message::user("old")]);
        let placeholder = Message::placeholder();
        let id = placeholder.id.clone();
        let discarded = before
            .apply(&Transition::Submit {
                user: Message::user("new"),
                placeholder,
            })
            .and_then(|s| {
                s.apply(&Transition::Fragment {
                    message_id: id.clone(),
                    text: "half".to_string(),
                })
            })
            .and_then(|s| s.apply(&Transition::Discard { message_id: id }))
            .unwrap();

        assert_eq!(discarded.history, before.history);
        assert_eq!(discarded.phase, GenerationPhase::Idle);
    }

    #[test]
    fn transitions_for_other_messages_are_rejected() {
        let (snapshot, _) = submitted("hi");
        let stranger = MessageId::new();
        let result = snapshot.apply(&Transition::Fragment {
            message_id: stranger.clone(),
            text: "x".to_string(),
        });
        assert_eq!(result.unwrap_err(), TransitionError::NotInFlight(stranger));

        let idle = SessionSnapshot::new(gem(), Vec::new());
        assert!(
            idle.apply(&Transition::Settle {
                message_id: MessageId::new()
            })
            .is_err()
        );
    }

    #[test]
    fn voice_suffix_only_changes_outgoing_text() {
        let snapshot = SessionSnapshot::new(gem(), Vec::new())
            .apply(&Transition::SetVoiceMode(true))
            .unwrap();
        assert_eq!(
            snapshot.outgoing_text("hi"),
            format!("hi{VOICE_MODE_SUFFIX}")
        );
        assert_eq!(
            SessionSnapshot::new(gem(), Vec::new()).outgoing_text("hi"),
            "hi"
        );
    }

    #[test]
    fn stale_streaming_history_is_marked_failed() {
        let snapshot =
            SessionSnapshot::new(gem(), vec![Message::user("q"), Message::placeholder()]);
        assert_eq!(snapshot.streaming_count(), 0);
        assert_eq!(snapshot.history[1].status, MessageStatus::Failed);
        assert_eq!(snapshot.history[1].content, STREAM_FAILURE_TEXT);
    }
}
