//! Server-wide session map.
//!
//! One registry per process, owned by the API collaborator. Sessions are
//! looked up by the caller-chosen id; creation of a given id is exclusive
//! even while a handshake for it is still in flight, and such in-flight
//! creations are observable through [`SessionRegistry::state`] as
//! `Initializing`.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use tokio::sync::Mutex;

use crate::animator;
use crate::error::{Error, Result};
use crate::session::{EngineLauncher, Session, SessionId, SessionState, StateCell, new_state_cell};

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, Arc<Session>>,
    /// Ids whose `create` is still running; they collide like live sessions
    /// and expose their lifecycle cell until creation settles.
    pending: HashMap<String, StateCell>,
}

/// Mapping from session id to [`Session`].
#[derive(Debug)]
pub struct SessionRegistry {
    launcher: EngineLauncher,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    /// Registry with the default engine launcher.
    pub fn new() -> SessionRegistry {
        SessionRegistry::with_launcher(EngineLauncher::detect())
    }

    /// Registry spawning engines through the given launcher.
    pub fn with_launcher(launcher: EngineLauncher) -> SessionRegistry {
        SessionRegistry {
            launcher,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a session. The id, the animator kind, and the source reference
    /// are validated here, before any lifecycle starts; see [`Session`] for
    /// everything that happens after the engine is spawned.
    pub async fn create(&self, id: &str, kind: &str, source: &str) -> Result<Arc<Session>> {
        let session_id = SessionId::parse(id)?;
        let kind_def = animator::lookup(kind)
            .ok_or_else(|| Error::InvalidInput(format!("unknown animator kind '{kind}'")))?;
        kind_def.check_source(source).map_err(Error::InvalidInput)?;

        let state = new_state_cell();
        {
            let mut inner = self.inner.lock().await;
            if inner.sessions.contains_key(id) || inner.pending.contains_key(id) {
                return Err(Error::AlreadyExists(id.to_owned()));
            }
            inner.pending.insert(id.to_owned(), state.clone());
        }

        let created = Session::create(session_id, kind, source, &self.launcher, state).await;

        let mut inner = self.inner.lock().await;
        inner.pending.remove(id);
        match created {
            Ok(session) => {
                info!("session '{id}' created ({kind} on '{source}')");
                inner.sessions.insert(id.to_owned(), session.clone());
                Ok(session)
            }
            Err(err) => Err(err),
        }
    }

    /// Look up a session by id.
    pub async fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.inner
            .lock()
            .await
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// Lifecycle state of a session. Creations still in flight report
    /// `Initializing` (or `Failed`, briefly, when they are about to return
    /// an error); unknown ids report `None`.
    pub async fn state(&self, id: &str) -> Option<SessionState> {
        let inner = self.inner.lock().await;
        if let Some(cell) = inner.pending.get(id) {
            return Some(*cell.lock());
        }
        inner.sessions.get(id).map(|session| session.state())
    }

    /// Remove a session from the map and close it.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let session = self
            .inner
            .lock()
            .await
            .sessions
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_owned()))?;
        info!("session '{id}' deleted");
        session.close().await
    }

    /// Ids of all live sessions.
    pub async fn ids(&self) -> Vec<String> {
        self.inner.lock().await.sessions.keys().cloned().collect()
    }

    /// Close and drop every session.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock().await;
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            let _ = session.close().await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Creation against a real engine binary is covered by the integration
    // suite; these only exercise the map semantics that need no engine.

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let registry = SessionRegistry::new();
        assert!(matches!(registry.get("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(
            registry.delete("nope").await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(registry.state("nope").await, None);
        assert!(registry.ids().await.is_empty());
    }

    #[tokio::test]
    async fn bad_ids_are_rejected_before_spawning() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.create("bad id", "wave", "8").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            registry.create("ok", "no-such-kind", "8").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            registry.create("ok", "wave", "not-a-count").await,
            Err(Error::InvalidInput(_))
        ));
        // Rejected creations never enter the lifecycle.
        assert_eq!(registry.state("ok").await, None);
    }
}
