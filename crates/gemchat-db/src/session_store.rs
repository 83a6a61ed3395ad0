use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use gemchat_common::{Error, Gem, GemId, Message, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::seed::default_gems;

const GEMS_KEY: &str = "gems_v1";
const CHATS_KEY: &str = "chats_v1";

/// Persona id to ordered message history.
pub type Sessions = BTreeMap<GemId, Vec<Message>>;

/// Everything needed to start the app.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedState {
    pub gems: Vec<Gem>,
    pub sessions: Sessions,
}

impl LoadedState {
    /// Built-in personas with empty histories.
    pub fn defaults() -> Self {
        let gems = default_gems();
        let sessions = gems.iter().map(|g| (g.id.clone(), Vec::new())).collect();
        Self { gems, sessions }
    }

    pub fn history(&self, gem_id: &GemId) -> &[Message] {
        self.sessions.get(gem_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The operations the chat controller needs from durable storage.
///
/// None of them report failure to the caller: a broken store must never stop
/// a conversation. Implementations log and carry on.
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> LoadedState;
    fn save_gems(&self, gems: &[Gem]);
    fn save_session(&self, gem_id: &GemId, messages: &[Message]);
    fn clear_all(&self);
}

/// Key-value persistence of personas and chat sessions in SQLite.
///
/// Two logical keys are stored as JSON documents: the persona list and the
/// map from persona id to messages. Writes replace whole documents.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening session store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::with_connection(conn)
    }

    /// Open `db_path`, or fall back to a non-durable in-memory store if the
    /// file cannot be used.
    pub fn open_or_in_memory(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("cannot create {}: {e}", parent.display());
            }
        }

        match Self::open(db_path) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!("session store unavailable, history will not survive restart: {e}");
                Self::in_memory()
            }
        }
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(|e| Error::Database(format!("migration failed: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("session store lock poisoned".to_string()))
    }

    /// Load personas and sessions, seeding defaults into an empty store.
    pub fn try_load(&self) -> Result<LoadedState> {
        let conn = self.lock()?;

        let mut gems: Vec<Gem> = match read_value(&conn, GEMS_KEY)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        if gems.is_empty() {
            info!("seeding {} default gems", default_gems().len());
            gems = default_gems();
            write_value(&conn, GEMS_KEY, &serde_json::to_string(&gems)?)?;
        }

        let mut sessions: Sessions = match read_value(&conn, CHATS_KEY)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => {
                write_value(&conn, CHATS_KEY, "{}")?;
                Sessions::new()
            }
        };
        for gem in &gems {
            sessions.entry(gem.id.clone()).or_default();
        }

        debug!(
            "loaded {} gems and {} non-empty sessions",
            gems.len(),
            sessions.values().filter(|m| !m.is_empty()).count()
        );
        Ok(LoadedState { gems, sessions })
    }

    pub fn try_save_gems(&self, gems: &[Gem]) -> Result<()> {
        let conn = self.lock()?;
        write_value(&conn, GEMS_KEY, &serde_json::to_string(gems)?)
    }

    /// Replace one persona's history inside the sessions document.
    pub fn try_save_session(&self, gem_id: &GemId, messages: &[Message]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        let mut sessions: Sessions = match read_value(&tx, CHATS_KEY)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("stored sessions unreadable, rewriting document: {e}");
                Sessions::new()
            }),
            None => Sessions::new(),
        };
        sessions.insert(gem_id.clone(), messages.to_vec());
        write_value(&tx, CHATS_KEY, &serde_json::to_string(&sessions)?)?;

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit session: {e}")))
    }

    pub fn try_clear_all(&self) -> Result<()> {
        let conn = self.lock()?;
        write_value(&conn, GEMS_KEY, &serde_json::to_string(&default_gems())?)?;
        write_value(&conn, CHATS_KEY, "{}")
    }

    /// Raw stored document, for diagnostics and tests.
    pub fn raw_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        read_value(&conn, key)
    }
}

impl SessionPersistence for SessionStore {
    fn load(&self) -> LoadedState {
        match self.try_load() {
            Ok(state) => state,
            Err(e) => {
                warn!("failed to load sessions, starting from defaults: {e}");
                LoadedState::defaults()
            }
        }
    }

    fn save_gems(&self, gems: &[Gem]) {
        if let Err(e) = self.try_save_gems(gems) {
            warn!("failed to save gems: {e}");
        }
    }

    fn save_session(&self, gem_id: &GemId, messages: &[Message]) {
        if let Err(e) = self.try_save_session(gem_id, messages) {
            warn!("failed to save session for gem {gem_id}: {e}");
        }
    }

    fn clear_all(&self) {
        if let Err(e) = self.try_clear_all() {
            warn!("failed to clear store: {e}");
        }
    }
}

fn read_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
    .map_err(|e| Error::Database(format!("failed to read {key}: {e}")))
}

/// Upsert a document. Writing an identical value leaves the row untouched.
fn write_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at
         WHERE kv.value <> excluded.value",
        params![key, value, chrono::Utc::now().to_rfc3339()],
    )
    .map_err(|e| Error::Database(format!("failed to write {key}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemchat_common::{MessageStatus, Role};

    fn reply(text: &str) -> Message {
        let mut message = Message::placeholder();
        message.content = text.to_string();
        message.status = MessageStatus::Settled;
        message
    }

    #[test]
    fn fresh_store_seeds_defaults_once() {
        let store = SessionStore::in_memory().expect("in-memory store should open");

        let first = store.try_load().expect("first load");
        assert_eq!(first.gems, default_gems());
        assert!(first.sessions.values().all(Vec::is_empty));
        assert_eq!(first.sessions.len(), first.gems.len());

        let second = store.try_load().expect("second load");
        assert_eq!(second, first);
    }

    #[test]
    fn seeded_store_is_not_reseeded() {
        let store = SessionStore::in_memory().unwrap();
        let mut gems = store.load().gems;
        gems.truncate(1);
        store.save_gems(&gems);

        let loaded = store.load();
        assert_eq!(loaded.gems, gems);
    }

    #[test]
    fn save_session_round_trip() {
        let store = SessionStore::in_memory().unwrap();
        let gem_id = GemId::new("coding-partner");
        let messages = vec![Message::user("hi"), reply("hello")];

        store.save_session(&gem_id, &messages);

        let loaded = store.load();
        assert_eq!(loaded.history(&gem_id), messages.as_slice());
        assert_eq!(loaded.history(&gem_id)[0].role, Role::User);
    }

    #[test]
    fn save_session_is_idempotent() {
        let store = SessionStore::in_memory().unwrap();
        store.load();
        let gem_id = GemId::new("brainstormer");
        let messages = vec![Message::user("one"), reply("two")];

        store.try_save_session(&gem_id, &messages).unwrap();
        let once = store.raw_value(CHATS_KEY).unwrap();
        let once_state = store.load();

        store.try_save_session(&gem_id, &messages).unwrap();
        let twice = store.raw_value(CHATS_KEY).unwrap();

        assert_eq!(once, twice);
        assert_eq!(store.load(), once_state);
    }

    #[test]
    fn save_session_replaces_wholesale_and_keeps_others() {
        let store = SessionStore::in_memory().unwrap();
        let a = GemId::new("a");
        let b = GemId::new("b");

        store.save_session(&a, &[Message::user("a1"), Message::user("a2")]);
        store.save_session(&b, &[Message::user("b1")]);
        store.save_session(&a, &[Message::user("a3")]);

        let loaded = store.load();
        let a_history: Vec<_> = loaded.history(&a).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(a_history, vec!["a3"]);
        assert_eq!(loaded.history(&b).len(), 1);
    }

    #[test]
    fn clear_all_restores_defaults() {
        let store = SessionStore::in_memory().unwrap();
        store.save_gems(&[]);
        store.save_session(&GemId::new("brainstormer"), &[Message::user("x")]);

        store.clear_all();

        let loaded = store.load();
        assert_eq!(loaded, LoadedState::defaults());
    }

    #[test]
    fn corrupt_document_falls_back_to_defaults() {
        let store = SessionStore::in_memory().unwrap();
        {
            let conn = store.lock().unwrap();
            write_value(&conn, CHATS_KEY, "{not json").unwrap();
        }

        assert!(store.try_load().is_err());
        assert_eq!(store.load(), LoadedState::defaults());
    }

    #[test]
    fn save_after_corrupt_document_repairs_sessions() {
        let store = SessionStore::in_memory().unwrap();
        {
            let conn = store.lock().unwrap();
            write_value(&conn, CHATS_KEY, "{not json").unwrap();
        }

        let gem_id = GemId::new("brainstormer");
        store
            .try_save_session(&gem_id, &[Message::user("after corruption")])
            .unwrap();

        let loaded = store.try_load().unwrap();
        assert_eq!(loaded.history(&gem_id).len(), 1);
        assert_eq!(loaded.history(&gem_id)[0].content, "after corruption");
    }

    #[test]
    fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gemchat.db");
        let gem_id = GemId::new("learning-coach");

        {
            let store = SessionStore::open(&path).unwrap();
            store.save_session(&gem_id, &[Message::user("remember me")]);
        }

        let store = SessionStore::open(&path).unwrap();
        assert_eq!(store.load().history(&gem_id)[0].content, "remember me");
    }

    #[test]
    fn unopenable_path_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file.
        let store = SessionStore::open_or_in_memory(dir.path()).expect("fallback store");
        assert_eq!(store.load(), LoadedState::defaults());
    }
}
