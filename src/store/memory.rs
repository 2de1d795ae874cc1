//! In-memory reference store
//!
//! Backs the test suite and small deployments. Shares state across clones,
//! so one [`MemoryStore`] can serve as user, session, and event store for a
//! single service instance while the test keeps a handle for inspection.
//!
//! Includes a failure injector: tests arm it to make the next N operations
//! return `Unavailable`, which is how the retry and timeout discipline in
//! the service layer gets exercised.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::events::SecurityEvent;
use crate::user::User;

use super::{Mailer, MailerError, SecurityEventStore, Session, SessionStore, StoreError, UserStore};

// ============================================================================
// Store
// ============================================================================

/// Concurrent in-memory implementation of all three storage ports
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    users: Arc<DashMap<Uuid, User>>,
    email_index: Arc<DashMap<String, Uuid>>,
    sessions: Arc<DashMap<Uuid, Session>>,
    events: Arc<Mutex<Vec<SecurityEvent>>>,
    /// Remaining operations that should fail with `Unavailable`
    fail_next: Arc<AtomicU32>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations (reads and writes alike) fail
    pub fn inject_failures(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Snapshot of every recorded event, oldest first
    #[must_use]
    pub fn all_events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one kind, oldest first
    #[must_use]
    pub fn events_of_kind(&self, kind: crate::events::SecurityEventKind) -> Vec<SecurityEvent> {
        self.all_events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    /// Number of stored sessions, live or not
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn gate(&self) -> Result<(), StoreError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl UserStore for MemoryStore {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        self.gate()?;
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.gate()?;
        let Some(id) = self.email_index.get(email).map(|e| *e) else {
            return Ok(None);
        };
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn find_user_by_reset_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<User>, StoreError> {
        self.gate()?;
        Ok(self
            .users
            .iter()
            .find(|u| u.password_reset_token_hash.as_deref() == Some(token_hash))
            .map(|u| u.clone()))
    }

    async fn find_user_by_verification_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<User>, StoreError> {
        self.gate()?;
        Ok(self
            .users
            .iter()
            .find(|u| u.email_verification_token_hash.as_deref() == Some(token_hash))
            .map(|u| u.clone()))
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        self.gate()?;
        if self.users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user id {}", user.id)));
        }
        if self.email_index.contains_key(&user.email) {
            return Err(StoreError::Conflict(format!("email {}", user.email)));
        }
        self.email_index.insert(user.email.clone(), user.id);
        self.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        self.gate()?;
        let Some(mut existing) = self.users.get_mut(&user.id) else {
            return Err(StoreError::NotFound);
        };
        let mut updated = user.clone();
        updated.updated_at = Utc::now();
        *existing = updated;
        Ok(())
    }
}

impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.gate()?;
        // One active lineage per device: retire any predecessor
        if let Some(fp) = &session.device_fingerprint {
            for mut entry in self.sessions.iter_mut() {
                if entry.user_id == session.user_id
                    && entry.is_active
                    && entry.device_fingerprint.as_deref() == Some(fp)
                {
                    entry.is_active = false;
                }
            }
        }
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_session_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        self.gate()?;
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn find_active_session_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        self.gate()?;
        let now = Utc::now();
        Ok(self
            .sessions
            .iter()
            .find(|s| s.is_live(now) && s.token_hash == token_hash)
            .map(|s| s.clone()))
    }

    async fn find_session_by_replaced_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        self.gate()?;
        Ok(self
            .sessions
            .iter()
            .find(|s| s.replaced_hash.as_deref() == Some(token_hash))
            .map(|s| s.clone()))
    }

    async fn find_active_sessions_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Session>, StoreError> {
        self.gate()?;
        let now = Utc::now();
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_live(now))
            .map(|s| s.clone())
            .collect())
    }

    async fn is_session_active(
        &self,
        session_id: Uuid,
        token_hash: &str,
    ) -> Result<bool, StoreError> {
        self.gate()?;
        let now = Utc::now();
        Ok(self
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.is_live(now) && s.token_hash == token_hash))
    }

    async fn rotate_session(
        &self,
        session_id: Uuid,
        presented_hash: &str,
        new_hash: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.gate()?;
        let now = Utc::now();
        // get_mut holds the shard lock for the whole check-and-set, which is
        // what makes this a per-session CAS
        match self.sessions.get_mut(&session_id) {
            Some(mut s) if s.is_live(now) && s.token_hash == presented_hash => {
                s.replaced_hash = Some(std::mem::replace(
                    &mut s.token_hash,
                    new_hash.to_string(),
                ));
                s.expires_at = new_expires_at;
                s.rotated_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        self.gate()?;
        match self.sessions.get_mut(&session_id) {
            Some(mut s) if s.is_active => {
                s.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_sessions_for_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        self.gate()?;
        let mut revoked = 0;
        for mut entry in self.sessions.iter_mut() {
            if entry.user_id == user_id && entry.is_active {
                entry.is_active = false;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.gate()?;
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        Ok((before - self.sessions.len()) as u64)
    }
}

impl SecurityEventStore for MemoryStore {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.gate()?;
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    async fn recent_for_user(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StoreError> {
        self.gate()?;
        Ok(self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.user_id == Some(user_id) && e.created_at >= since)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Recording mailer
// ============================================================================

/// What kind of mail a [`RecordingMailer`] captured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    PasswordReset,
    EmailVerification,
}

/// One captured outbound message
#[derive(Debug, Clone)]
pub struct SentMail {
    pub kind: MailKind,
    pub email: String,
    /// The raw token, exactly as a real mail would carry it
    pub token: String,
}

/// Mailer that captures messages instead of sending them.
///
/// Tests use it to pull raw reset and verification tokens back out, since
/// stores only ever hold digests.
#[derive(Debug, Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<SentMail>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingMailer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail, or stop doing so
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All captured mail, oldest first
    #[must_use]
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Raw token from the newest mail of `kind` addressed to `email`
    #[must_use]
    pub fn last_token(&self, email: &str, kind: MailKind) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.email == email && m.kind == kind)
            .map(|m| m.token)
    }

    fn capture(&self, kind: MailKind, email: &str, token: &str) -> Result<(), MailerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MailerError("recording mailer set to fail".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMail {
                kind,
                email: email.to_string(),
                token: token.to_string(),
            });
        Ok(())
    }
}

impl Mailer for RecordingMailer {
    async fn send_password_reset(&self, email: &str, token: &str) -> Result<(), MailerError> {
        self.capture(MailKind::PasswordReset, email, token)
    }

    async fn send_email_verification(&self, email: &str, token: &str) -> Result<(), MailerError> {
        self.capture(MailKind::EmailVerification, email, token)
    }
}

#[cfg(test)]
mod tests {
    use super::super::DeviceInfo;
    use super::*;
    use crate::user::Role;
    use chrono::Duration;

    fn device() -> DeviceInfo {
        DeviceInfo {
            fingerprint: Some("fp-1".to_string()),
            ip_address: Some("10.0.0.1".to_string()),
            user_agent: Some("test-agent".to_string()),
        }
    }

    fn session_for(user_id: Uuid, hash: &str, device: &DeviceInfo) -> Session {
        Session::new(
            Uuid::now_v7(),
            user_id,
            hash.to_string(),
            Utc::now() + Duration::days(7),
            device,
        )
    }

    #[tokio::test]
    async fn test_user_email_lookup_uses_index() {
        let store = MemoryStore::new();
        let user = User::new("find-me@example.com", None, Role::Viewer);
        store.insert_user(&user).await.expect("insert");

        let found = store
            .find_user_by_email("find-me@example.com")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(found.id, user.id);

        assert!(store
            .find_user_by_email("missing@example.com")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let store = MemoryStore::new();
        store
            .insert_user(&User::new("dup@example.com", None, Role::Viewer))
            .await
            .expect("insert");
        let err = store
            .insert_user(&User::new("dup@example.com", None, Role::Viewer))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_missing_user_is_not_found() {
        let store = MemoryStore::new();
        let user = User::new("ghost@example.com", None, Role::Viewer);
        assert!(matches!(
            store.update_user(&user).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_rotation_cas_single_winner() {
        let store = MemoryStore::new();
        let user_id = Uuid::now_v7();
        let session = session_for(user_id, "hash-r1", &device());
        store.create_session(&session).await.expect("create");

        let expires = Utc::now() + Duration::days(7);
        // First rotation wins
        assert!(store
            .rotate_session(session.id, "hash-r1", "hash-r2", expires)
            .await
            .expect("rotate"));
        // Replay of the same presented hash loses the CAS
        assert!(!store
            .rotate_session(session.id, "hash-r1", "hash-r3", expires)
            .await
            .expect("rotate"));

        let current = store
            .find_session_by_id(session.id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(current.token_hash, "hash-r2");
        assert_eq!(current.replaced_hash.as_deref(), Some("hash-r1"));
        assert!(current.rotated_at.is_some());
    }

    #[tokio::test]
    async fn test_replaced_hash_traces_lineage() {
        let store = MemoryStore::new();
        let session = session_for(Uuid::now_v7(), "hash-r1", &device());
        store.create_session(&session).await.expect("create");
        store
            .rotate_session(session.id, "hash-r1", "hash-r2", Utc::now() + Duration::days(7))
            .await
            .expect("rotate");

        // The superseded hash no longer finds an active session
        assert!(store
            .find_active_session_by_hash("hash-r1")
            .await
            .expect("find")
            .is_none());
        // But it traces back to its lineage
        let lineage = store
            .find_session_by_replaced_hash("hash-r1")
            .await
            .expect("find")
            .expect("lineage");
        assert_eq!(lineage.id, session.id);
    }

    #[tokio::test]
    async fn test_one_active_session_per_fingerprint() {
        let store = MemoryStore::new();
        let user_id = Uuid::now_v7();
        let dev = device();

        let first = session_for(user_id, "hash-a", &dev);
        store.create_session(&first).await.expect("create");
        let second = session_for(user_id, "hash-b", &dev);
        store.create_session(&second).await.expect("create");

        let active = store
            .find_active_sessions_for_user(user_id)
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);

        // A different device keeps its own lineage
        let other_dev = DeviceInfo {
            fingerprint: Some("fp-2".to_string()),
            ..device()
        };
        let third = session_for(user_id, "hash-c", &other_dev);
        store.create_session(&third).await.expect("create");
        assert_eq!(
            store
                .find_active_sessions_for_user(user_id)
                .await
                .expect("list")
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_revoke_all_counts() {
        let store = MemoryStore::new();
        let user_id = Uuid::now_v7();
        for i in 0..3 {
            let dev = DeviceInfo {
                fingerprint: Some(format!("fp-{i}")),
                ..device()
            };
            store
                .create_session(&session_for(user_id, &format!("hash-{i}"), &dev))
                .await
                .expect("create");
        }

        assert_eq!(
            store
                .revoke_all_sessions_for_user(user_id)
                .await
                .expect("revoke"),
            3
        );
        // Second pass has nothing left to do
        assert_eq!(
            store
                .revoke_all_sessions_for_user(user_id)
                .await
                .expect("revoke"),
            0
        );
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_only() {
        let store = MemoryStore::new();
        let user_id = Uuid::now_v7();

        let mut expired = session_for(user_id, "hash-old", &device());
        expired.expires_at = Utc::now() - Duration::hours(1);
        store.create_session(&expired).await.expect("create");

        let dev2 = DeviceInfo {
            fingerprint: Some("fp-live".to_string()),
            ..device()
        };
        store
            .create_session(&session_for(user_id, "hash-live", &dev2))
            .await
            .expect("create");

        assert_eq!(
            store.sweep_expired_sessions(Utc::now()).await.expect("sweep"),
            1
        );
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_not_live() {
        let store = MemoryStore::new();
        let mut session = session_for(Uuid::now_v7(), "hash-x", &device());
        session.expires_at = Utc::now() - Duration::seconds(1);
        store.create_session(&session).await.expect("create");

        assert!(store
            .find_active_session_by_hash("hash-x")
            .await
            .expect("find")
            .is_none());
        assert!(!store
            .is_session_active(session.id, "hash-x")
            .await
            .expect("check"));
    }

    #[tokio::test]
    async fn test_failure_injection_counts_down() {
        let store = MemoryStore::new();
        store.inject_failures(2);

        assert!(store.find_user_by_id(Uuid::now_v7()).await.is_err());
        assert!(store.find_user_by_id(Uuid::now_v7()).await.is_err());
        assert!(store.find_user_by_id(Uuid::now_v7()).await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_mailer_captures_and_fails() {
        let mailer = RecordingMailer::new();
        mailer
            .send_password_reset("a@b.co", "raw-token")
            .await
            .expect("send");
        assert_eq!(
            mailer.last_token("a@b.co", MailKind::PasswordReset).as_deref(),
            Some("raw-token")
        );
        assert!(mailer.last_token("a@b.co", MailKind::EmailVerification).is_none());

        mailer.set_failing(true);
        assert!(mailer.send_password_reset("a@b.co", "t2").await.is_err());
    }
}
