pub mod error;
pub mod gem;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use gem::{COLOR_PALETTE, DEFAULT_STARTER_PROMPTS, Gem, GemIcon, NewGem};
pub use message::{Message, MessageStatus, Role};
pub use types::{GemId, MessageId};
