use chrono::{DateTime, Utc};
use gemchat_common::{Gem, GemId, Message, MessageId};
use gemchat_db::Sessions;

use crate::session::SessionSnapshot;

/// What a front-end renders for the open session.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptView {
    pub gem_id: GemId,
    pub gem_name: String,
    pub messages: Vec<Message>,
    /// True exactly while a reply is awaited or streaming.
    pub input_disabled: bool,
    pub needs_credential: bool,
    pub voice_mode: bool,
    /// Suggested openers, only offered for an empty transcript.
    pub starter_prompts: Vec<String>,
    pub streaming_message_id: Option<MessageId>,
}

impl TranscriptView {
    pub fn project(snapshot: &SessionSnapshot) -> Self {
        let starter_prompts = if snapshot.history.is_empty() {
            snapshot.gem.starter_prompts.clone()
        } else {
            Vec::new()
        };

        Self {
            gem_id: snapshot.gem.id.clone(),
            gem_name: snapshot.gem.name.clone(),
            messages: snapshot.history.clone(),
            input_disabled: snapshot.is_busy(),
            needs_credential: snapshot.needs_credential,
            voice_mode: snapshot.voice_mode,
            starter_prompts,
            streaming_message_id: snapshot
                .phase
                .in_flight_ids()
                .map(|(_, message_id)| message_id.clone()),
        }
    }
}

/// A persona with at least one message, for the "recent chats" list.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentChat {
    pub gem: Gem,
    pub last_message: Message,
}

impl RecentChat {
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message.timestamp
    }
}

/// Non-empty sessions of known personas, most recently active first.
pub fn recent_chats(gems: &[Gem], sessions: &Sessions) -> Vec<RecentChat> {
    let mut recent: Vec<RecentChat> = sessions
        .iter()
        .filter_map(|(gem_id, messages)| {
            let last_message = messages.last()?;
            let gem = gems.iter().find(|g| &g.id == gem_id)?;
            Some(RecentChat {
                gem: gem.clone(),
                last_message: last_message.clone(),
            })
        })
        .collect();

    recent.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
    recent
}
