use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use gemchat_common::{Error, Gem, GemId, Message, MessageId, NewGem, Result};
use gemchat_config::ChatConfig;
use gemchat_db::{LoadedState, SessionWriter, Sessions};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, instrument, warn};

use crate::projection::{RecentChat, TranscriptView, recent_chats};
use crate::providers::StreamClient;
use crate::session::{FailureKind, SessionSnapshot, Transition, TransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Longest wait for the stream to open or yield its next fragment.
    /// `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl ControllerSettings {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            idle_timeout: config.stream_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyInput,
    Busy,
}

pub enum SendOutcome {
    Started(GenerationHandle),
    Rejected(RejectReason),
}

impl SendOutcome {
    pub fn into_handle(self) -> Option<GenerationHandle> {
        match self {
            SendOutcome::Started(handle) => Some(handle),
            SendOutcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            SendOutcome::Started(_) => None,
            SendOutcome::Rejected(reason) => Some(*reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Settled {
        message_id: MessageId,
    },
    Failed {
        message_id: MessageId,
        needs_credential: bool,
    },
    /// Discarded before it finished; nothing was kept.
    Cancelled,
}

/// Completion handle of one started generation.
pub struct GenerationHandle {
    message_id: MessageId,
    done: oneshot::Receiver<GenerationOutcome>,
}

impl GenerationHandle {
    /// Id of the model reply being generated.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub async fn wait(self) -> GenerationOutcome {
        self.done.await.unwrap_or(GenerationOutcome::Cancelled)
    }
}

struct ActiveGeneration {
    message_id: MessageId,
    abort: AbortHandle,
}

/// One open persona conversation.
///
/// The `watch` channel holds the only authoritative [`SessionSnapshot`]. All
/// changes go through [`SessionSnapshot::apply`] inside the channel's commit,
/// so concurrent senders cannot both start a generation.
pub struct ChatSession {
    state: Arc<watch::Sender<SessionSnapshot>>,
    client: Arc<dyn StreamClient>,
    writer: SessionWriter,
    settings: ControllerSettings,
    active: Mutex<Option<ActiveGeneration>>,
}

impl ChatSession {
    pub fn new(
        gem: Gem,
        history: Vec<Message>,
        client: Arc<dyn StreamClient>,
        writer: SessionWriter,
        settings: ControllerSettings,
    ) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::new(gem, history));
        Self {
            state: Arc::new(state),
            client,
            writer,
            settings,
            active: Mutex::new(None),
        }
    }

    pub fn gem_id(&self) -> GemId {
        self.state.borrow().gem.id.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn view(&self) -> TranscriptView {
        TranscriptView::project(&self.state.borrow())
    }

    /// Observe every committed change, fragments included.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Submit `text` and start generating a reply.
    ///
    /// The user message and the empty reply are committed before this
    /// returns; the upstream request runs on a spawned task. Must be called
    /// from within a Tokio runtime.
    pub fn send(&self, text: &str) -> SendOutcome {
        let placeholder = Message::placeholder();
        let message_id = placeholder.id.clone();
        let submit = Transition::Submit {
            user: Message::user(text),
            placeholder,
        };

        // Held until the abort handle is stored so a racing cancel() waits
        // for it instead of finding nothing to abort.
        let mut active = self.active_generation();
        let mut request = None;
        let mut rejection = None;
        self.state.send_if_modified(|snapshot| match snapshot.apply(&submit) {
            Ok(next) => {
                request = Some(Request {
                    prompt: snapshot.outgoing_text(text),
                    system_instruction: snapshot.gem.system_instruction.clone(),
                    history: snapshot.history.clone(),
                });
                *snapshot = next;
                true
            }
            Err(e) => {
                rejection = Some(e);
                false
            }
        });

        let Some(request) = request else {
            let reason = match rejection {
                Some(TransitionError::EmptyInput) => RejectReason::EmptyInput,
                // Submit fails only on empty input or a generation in flight.
                _ => RejectReason::Busy,
            };
            debug!("send rejected: {reason:?}");
            return SendOutcome::Rejected(reason);
        };

        let (done_tx, done_rx) = oneshot::channel();
        let task = Generation {
            state: Arc::clone(&self.state),
            client: Arc::clone(&self.client),
            writer: self.writer.clone(),
            idle_timeout: self.settings.idle_timeout,
            gem_id: self.gem_id(),
            message_id: message_id.clone(),
            request,
        };
        let join = tokio::spawn(async move {
            let outcome = task.run().await;
            let _ = done_tx.send(outcome);
        });

        *active = Some(ActiveGeneration {
            message_id: message_id.clone(),
            abort: join.abort_handle(),
        });
        drop(active);

        SendOutcome::Started(GenerationHandle {
            message_id,
            done: done_rx,
        })
    }

    pub fn set_voice_mode(&self, on: bool) {
        self.commit(&Transition::SetVoiceMode(on));
    }

    pub fn voice_mode(&self) -> bool {
        self.state.borrow().voice_mode
    }

    /// Clear the reconnect indicator once a credential has been supplied.
    pub fn dismiss_credential_prompt(&self) {
        self.commit(&Transition::DismissCredentialPrompt);
    }

    /// Abort the generation in flight and drop its messages. Returns whether
    /// anything was discarded.
    pub fn cancel(&self) -> bool {
        let Some(active) = self.active_generation().take() else {
            return false;
        };
        active.abort.abort();

        let discarded = self.commit(&Transition::Discard {
            message_id: active.message_id.clone(),
        });
        if discarded {
            info!("discarded generation {}", active.message_id);
        }
        discarded
    }

    /// Cancel anything in flight and hand back the committed history.
    pub fn close(&self) -> Vec<Message> {
        self.cancel();
        self.state.borrow().history.clone()
    }

    fn commit(&self, transition: &Transition) -> bool {
        commit(&self.state, transition)
    }

    fn active_generation(&self) -> MutexGuard<'_, Option<ActiveGeneration>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn commit(state: &watch::Sender<SessionSnapshot>, transition: &Transition) -> bool {
    state.send_if_modified(|snapshot| match snapshot.apply(transition) {
        Ok(next) => {
            *snapshot = next;
            true
        }
        Err(e) => {
            debug!("transition dropped: {e}");
            false
        }
    })
}

struct Request {
    prompt: String,
    system_instruction: String,
    /// History as it stood before the user message was appended.
    history: Vec<Message>,
}

struct Generation {
    state: Arc<watch::Sender<SessionSnapshot>>,
    client: Arc<dyn StreamClient>,
    writer: SessionWriter,
    idle_timeout: Option<Duration>,
    gem_id: GemId,
    message_id: MessageId,
    request: Request,
}

impl Generation {
    #[instrument(
        name = "generation",
        skip_all,
        fields(
            gem = %self.gem_id,
            message_id = %self.message_id,
            provider = self.client.provider_id()
        )
    )]
    async fn run(self) -> GenerationOutcome {
        let finish = match self.stream_reply().await {
            Ok(()) => Transition::Settle {
                message_id: self.message_id.clone(),
            },
            Err(e) => {
                warn!("generation failed: {e}");
                Transition::Fail {
                    message_id: self.message_id.clone(),
                    kind: FailureKind::of(&e),
                }
            }
        };

        if !self.commit_and_persist(&finish) {
            return GenerationOutcome::Cancelled;
        }

        match finish {
            Transition::Fail { message_id, kind } => GenerationOutcome::Failed {
                message_id,
                needs_credential: kind == FailureKind::Auth,
            },
            _ => {
                debug!("generation settled");
                GenerationOutcome::Settled {
                    message_id: self.message_id,
                }
            }
        }
    }

    async fn stream_reply(&self) -> Result<()> {
        let request = &self.request;
        let mut stream = self
            .idle(self.client.open_stream(
                &request.prompt,
                &request.system_instruction,
                &request.history,
            ))
            .await??;

        while let Some(fragment) = self.idle(stream.next()).await? {
            let transition = Transition::Fragment {
                message_id: self.message_id.clone(),
                text: fragment?,
            };
            if !commit(&self.state, &transition) {
                return Err(Error::Stream("generation is no longer active".to_string()));
            }
        }
        Ok(())
    }

    async fn idle<F: Future>(&self, fut: F) -> Result<F::Output> {
        match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                Error::Stream(format!("no response from provider within {limit:?}"))
            }),
            None => Ok(fut.await),
        }
    }

    /// Commit a terminal transition and queue the resulting history for
    /// storage. The write is queued inside the commit so writes reach the
    /// store in commit order.
    fn commit_and_persist(&self, transition: &Transition) -> bool {
        self.state
            .send_if_modified(|snapshot| match snapshot.apply(transition) {
                Ok(next) => {
                    self.writer.save_session(&self.gem_id, next.history.clone());
                    *snapshot = next;
                    true
                }
                Err(e) => {
                    debug!("terminal transition dropped: {e}");
                    false
                }
            })
    }
}

/// Workspace-level owner of personas and sessions. At most one session is
/// open at a time; opening another one cancels the current generation.
pub struct ChatController {
    gems: Vec<Gem>,
    sessions: Sessions,
    active: Option<Arc<ChatSession>>,
    client: Arc<dyn StreamClient>,
    writer: SessionWriter,
    settings: ControllerSettings,
}

impl ChatController {
    pub fn new(
        loaded: LoadedState,
        client: Arc<dyn StreamClient>,
        writer: SessionWriter,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            gems: loaded.gems,
            sessions: loaded.sessions,
            active: None,
            client,
            writer,
            settings,
        }
    }

    pub fn gems(&self) -> &[Gem] {
        &self.gems
    }

    pub fn gem(&self, gem_id: &GemId) -> Option<&Gem> {
        self.gems.iter().find(|g| &g.id == gem_id)
    }

    pub fn active(&self) -> Option<Arc<ChatSession>> {
        self.active.clone()
    }

    /// Validate and add a custom persona, persisting the persona list.
    pub fn create_gem(&mut self, new_gem: NewGem) -> Result<Gem> {
        let gem = new_gem.build()?;
        info!("created gem {} ({})", gem.name, gem.id);
        self.sessions.entry(gem.id.clone()).or_default();
        self.gems.push(gem.clone());
        self.writer.save_gems(self.gems.clone());
        Ok(gem)
    }

    /// Open the session of `gem_id`, closing the one currently open.
    pub fn open(&mut self, gem_id: &GemId) -> Result<Arc<ChatSession>> {
        if let Some(active) = self.active.as_ref().filter(|s| &s.gem_id() == gem_id) {
            return Ok(Arc::clone(active));
        }

        let gem = self
            .gem(gem_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("gem {gem_id}")))?;

        self.close_active();

        let history = self.sessions.get(gem_id).cloned().unwrap_or_default();
        info!("opening chat with {} ({} messages)", gem.name, history.len());
        let session = Arc::new(ChatSession::new(
            gem,
            history,
            Arc::clone(&self.client),
            self.writer.clone(),
            self.settings,
        ));
        self.active = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Close the open session, keeping its committed history.
    pub fn close_active(&mut self) {
        if let Some(previous) = self.active.take() {
            let history = previous.close();
            self.sessions.insert(previous.gem_id(), history);
        }
    }

    /// All histories, the open session's included.
    pub fn sessions(&self) -> Sessions {
        let mut sessions = self.sessions.clone();
        if let Some(active) = &self.active {
            sessions.insert(active.gem_id(), active.snapshot().history);
        }
        sessions
    }

    pub fn recent(&self) -> Vec<RecentChat> {
        recent_chats(&self.gems, &self.sessions())
    }

    /// Forget every custom persona and all history.
    pub fn reset(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel();
        }
        self.writer.clear_all();
        let defaults = LoadedState::defaults();
        self.gems = defaults.gems;
        self.sessions = defaults.sessions;
        info!("reset all gems and chats");
    }
}
