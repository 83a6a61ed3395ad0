use std::sync::Arc;

use gemchat_common::{Gem, GemId, Message};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::session_store::SessionPersistence;

enum WriteOp {
    Gems(Vec<Gem>),
    Session { gem_id: GemId, messages: Vec<Message> },
    ClearAll,
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget handle for persisting committed state.
///
/// Every write goes through one queue drained by a single task, so the
/// store sees writes in exactly the order they were requested.
#[derive(Clone)]
pub struct SessionWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl SessionWriter {
    /// Start the writer task on the current Tokio runtime.
    pub fn spawn(store: Arc<dyn SessionPersistence>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let op = match op {
                    WriteOp::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                    other => other,
                };

                let store = Arc::clone(&store);
                let result = tokio::task::spawn_blocking(move || match op {
                    WriteOp::Gems(gems) => store.save_gems(&gems),
                    WriteOp::Session { gem_id, messages } => {
                        debug!("persisting {} messages for gem {gem_id}", messages.len());
                        store.save_session(&gem_id, &messages);
                    }
                    WriteOp::ClearAll => store.clear_all(),
                    WriteOp::Flush(_) => {}
                })
                .await;

                if let Err(e) = result {
                    warn!("session write task failed: {e}");
                }
            }
            debug!("session writer stopped");
        });

        Self { tx }
    }

    pub fn save_session(&self, gem_id: &GemId, messages: Vec<Message>) {
        self.enqueue(WriteOp::Session {
            gem_id: gem_id.clone(),
            messages,
        });
    }

    pub fn save_gems(&self, gems: Vec<Gem>) {
        self.enqueue(WriteOp::Gems(gems));
    }

    pub fn clear_all(&self) {
        self.enqueue(WriteOp::ClearAll);
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(WriteOp::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn enqueue(&self, op: WriteOp) {
        if self.tx.send(op).is_err() {
            warn!("session writer is gone, dropping write");
        }
    }
}
