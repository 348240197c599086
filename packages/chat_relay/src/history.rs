//! Per-session conversation history.
//!
//! Only completed turns are recorded, as a user entry followed by an
//! assistant entry written under one lock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::HistoryConfig;
use crate::producer::ChatMessage;

/// History is kept separately per variant and client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub variant: String,
    pub session: String,
}

impl SessionKey {
    pub fn new(variant: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            variant: variant.into(),
            session: session.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.variant, self.session)
    }
}

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Prior messages for the session, oldest first.
    async fn history(&self, key: &SessionKey) -> Vec<ChatMessage>;

    /// Record a completed turn as two entries, user then assistant.
    async fn append(&self, key: &SessionKey, turn: Turn);

    /// Drop idle sessions, returning how many were removed.
    async fn evict_expired(&self) -> usize;
}

struct Session {
    messages: Vec<ChatMessage>,
    last_active: Instant,
}

/// In-process store; contents are lost on restart.
pub struct InMemoryHistory {
    sessions: RwLock<HashMap<SessionKey, Session>>,
    max_turns: Option<usize>,
    ttl: Option<Duration>,
}

impl InMemoryHistory {
    pub fn new(max_turns: Option<usize>, ttl: Option<Duration>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns,
            ttl,
        }
    }

    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::new(config.max_turns, config.ttl)
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn is_expired(&self, session: &Session, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.duration_since(session.last_active) > ttl)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn history(&self, key: &SessionKey) -> Vec<ChatMessage> {
        let sessions = self.sessions.read().await;
        match sessions.get(key) {
            Some(session) if !self.is_expired(session, Instant::now()) => session.messages.clone(),
            _ => Vec::new(),
        }
    }

    async fn append(&self, key: &SessionKey, turn: Turn) {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(key.clone()).or_insert_with(|| Session {
            messages: Vec::new(),
            last_active: now,
        });
        if self.is_expired(session, now) {
            session.messages.clear();
        }

        session.messages.push(ChatMessage::user(turn.user));
        session.messages.push(ChatMessage::assistant(turn.assistant));
        if let Some(max_turns) = self.max_turns {
            let excess = session.messages.len().saturating_sub(max_turns * 2);
            session.messages.drain(..excess);
        }
        session.last_active = now;

        debug!(
            session = %key,
            entries = session.messages.len(),
            "Recorded turn in history"
        );
    }

    async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !self.is_expired(session, now));
        before - sessions.len()
    }
}

/// Periodically evict idle sessions until `shutdown` fires.
pub fn spawn_sweeper(
    store: Arc<dyn HistoryStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = store.evict_expired().await;
                    if evicted > 0 {
                        info!("Evicted {} idle chat sessions", evicted);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::Role;

    fn turn(user: &str, assistant: &str) -> Turn {
        Turn {
            user: user.into(),
            assistant: assistant.into(),
        }
    }

    #[tokio::test]
    async fn append_records_two_entries() {
        let store = InMemoryHistory::new(None, None);
        let key = SessionKey::new("travel", "s1");
        store.append(&key, turn("Plan a trip", "# Travel Plan")).await;

        let history = store.history(&key).await;
        assert_eq!(
            history,
            vec![
                ChatMessage::user("Plan a trip"),
                ChatMessage::assistant("# Travel Plan"),
            ]
        );
    }

    #[tokio::test]
    async fn sessions_are_isolated_per_variant() {
        let store = InMemoryHistory::new(None, None);
        store
            .append(&SessionKey::new("travel", "s1"), turn("a", "b"))
            .await;
        assert!(store.history(&SessionKey::new("dating", "s1")).await.is_empty());
        assert!(store.history(&SessionKey::new("travel", "s2")).await.is_empty());
        assert_eq!(SessionKey::new("travel", "s1").to_string(), "travel/s1");
    }

    #[tokio::test]
    async fn max_turns_drops_oldest() {
        let store = InMemoryHistory::new(Some(2), None);
        let key = SessionKey::new("advisor", "s");
        for i in 0..3 {
            store
                .append(&key, turn(&format!("q{i}"), &format!("a{i}")))
                .await;
        }

        let history = store.history(&key).await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0], ChatMessage::user("q1"));
        assert_eq!(history[3].role, Role::Assistant);
        assert_eq!(history[3].content, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_expire() {
        let store = InMemoryHistory::new(None, Some(Duration::from_secs(60)));
        let key = SessionKey::new("advisor", "s");
        store.append(&key, turn("q", "a")).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.history(&key).await.len(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.history(&key).await.is_empty());
        assert_eq!(store.evict_expired().await, 1);
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn append_after_expiry_starts_fresh() {
        let store = InMemoryHistory::new(None, Some(Duration::from_secs(10)));
        let key = SessionKey::new("advisor", "s");
        store.append(&key, turn("old", "old")).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        store.append(&key, turn("new", "new")).await;
        assert_eq!(
            store.history(&key).await,
            vec![ChatMessage::user("new"), ChatMessage::assistant("new")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_and_stops() {
        let store = Arc::new(InMemoryHistory::new(None, Some(Duration::from_secs(5))));
        store
            .append(&SessionKey::new("advisor", "s"), turn("q", "a"))
            .await;

        let shutdown = CancellationToken::new();
        let handle = spawn_sweeper(store.clone(), Duration::from_secs(10), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(store.session_count().await, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
