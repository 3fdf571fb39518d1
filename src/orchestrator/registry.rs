//! Session registry: authoritative in-memory table plus durable snapshot.
//!
//! Nothing else owns session identity. Mutations are serialized behind a
//! single writer lock and written through to an atomic JSON snapshot
//! (temp file + rename) so a crash never leaves a torn state file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::session::{Session, SessionStatus};
use crate::{AppError, Result};

/// External-chat forum topic inherited by successive EM sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EmTopic {
    /// Chat the topic lives in.
    pub chat_id: i64,
    /// Forum thread id; `None` for plain chats.
    pub thread_id: Option<i64>,
}

/// On-disk snapshot shape. Missing fields are treated as defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    em_topic: Option<EmTopic>,
}

/// Authoritative session table.
pub struct SessionRegistry {
    state_file: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    sessions: HashMap<String, Session>,
    em_topic: Option<EmTopic>,
}

impl SessionRegistry {
    /// Load the registry from its snapshot, starting empty when the
    /// snapshot does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if an existing snapshot cannot be read or
    /// parsed.
    pub async fn load(state_file: PathBuf) -> Result<Self> {
        let snapshot = match tokio::fs::read_to_string(&state_file).await {
            Ok(raw) => serde_json::from_str::<Snapshot>(&raw)
                .map_err(|err| AppError::Io(format!("corrupt state file: {err}")))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(err) => return Err(AppError::Io(format!("failed to read state file: {err}"))),
        };

        let sessions = snapshot
            .sessions
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect::<HashMap<_, _>>();
        info!(count = sessions.len(), "session registry loaded");

        Ok(Self {
            state_file,
            inner: RwLock::new(Inner {
                sessions,
                em_topic: snapshot.em_topic,
            }),
        })
    }

    /// Insert a new session and persist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the snapshot write fails.
    pub async fn create(&self, session: Session) -> Result<Session> {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id.clone(), session.clone());
        self.persist(&inner).await?;
        Ok(session)
    }

    /// Fetch a session by exact id.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    /// All sessions, unordered.
    pub async fn list(&self) -> Vec<Session> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    /// Resolve an identifier: exact id, friendly name, or unambiguous
    /// id prefix.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown or ambiguous identifiers.
    pub async fn resolve(&self, identifier: &str) -> Result<Session> {
        let inner = self.inner.read().await;
        if let Some(session) = inner.sessions.get(identifier) {
            return Ok(session.clone());
        }
        if let Some(session) = inner
            .sessions
            .values()
            .find(|s| s.friendly_name.as_deref() == Some(identifier))
        {
            return Ok(session.clone());
        }
        let mut matches = inner
            .sessions
            .values()
            .filter(|s| s.id.starts_with(identifier));
        match (matches.next(), matches.next()) {
            (Some(session), None) => Ok(session.clone()),
            (Some(_), Some(_)) => Err(AppError::NotFound(format!(
                "identifier '{identifier}' is ambiguous"
            ))),
            _ => Err(AppError::NotFound(format!(
                "no session matches '{identifier}'"
            ))),
        }
    }

    /// Update a session's lifecycle status, enforcing the state machine,
    /// and persist. A same-status update is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids and
    /// `AppError::InvalidState` for a transition out of `Stopped`.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<Session> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
        if session.status == status {
            return Ok(session.clone());
        }
        if !session.can_transition_to(status) {
            return Err(AppError::InvalidState(format!(
                "session {id} cannot move from {:?} to {status:?}",
                session.status
            )));
        }
        session.status = status;
        session.last_activity = chrono::Utc::now();
        let updated = session.clone();
        self.persist(&inner).await?;
        Ok(updated)
    }

    /// Apply an arbitrary mutation to a session and persist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
        mutate(session);
        let updated = session.clone();
        self.persist(&inner).await?;
        Ok(updated)
    }

    /// Remove a session entirely and persist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids.
    pub async fn remove(&self, id: &str) -> Result<Session> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .sessions
            .remove(id)
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
        self.persist(&inner).await?;
        Ok(removed)
    }

    /// The inherited EM topic, if any.
    pub async fn em_topic(&self) -> Option<EmTopic> {
        self.inner.read().await.em_topic
    }

    /// Store the EM topic for inheritance by the next EM session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the snapshot write fails.
    pub async fn set_em_topic(&self, topic: Option<EmTopic>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.em_topic = topic;
        self.persist(&inner).await
    }

    /// Write the snapshot atomically: serialize, write a temp file in
    /// the same directory, rename over the target.
    async fn persist(&self, inner: &Inner) -> Result<()> {
        let snapshot = Snapshot {
            sessions: inner.sessions.values().cloned().collect(),
            em_topic: inner.em_topic,
        };
        let raw = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| AppError::Io(format!("failed to serialize state: {err}")))?;

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.state_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &self.state_file).await {
            warn!(%err, "state snapshot rename failed");
            return Err(err.into());
        }
        Ok(())
    }
}
