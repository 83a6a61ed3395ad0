pub mod controller;
pub mod markup;
pub mod projection;
pub mod providers;
pub mod session;

pub use controller::{
    ChatController, ChatSession, ControllerSettings, GenerationHandle, GenerationOutcome,
    RejectReason, SendOutcome,
};
pub use projection::{RecentChat, TranscriptView, recent_chats};
pub use providers::{FragmentStream, GeminiProvider, StreamClient};
pub use session::{
    AUTH_FAILURE_TEXT, FailureKind, GenerationPhase, STREAM_FAILURE_TEXT, SessionSnapshot,
    Transition, TransitionError, VOICE_MODE_SUFFIX,
};
