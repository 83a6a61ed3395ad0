pub mod seed;
pub mod session_store;
pub mod writer;

pub use seed::default_gems;
pub use session_store::{LoadedState, SessionPersistence, SessionStore, Sessions};
pub use writer::SessionWriter;
