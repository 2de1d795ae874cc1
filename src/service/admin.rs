//! Administrative account operations

use serde_json::json;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::events::SecurityEventKind;
use crate::store::{DeviceInfo, Mailer, SecurityEventStore, SessionStore, UserStore};

use super::AuthService;

impl<U, S, E, M> AuthService<U, S, E, M>
where
    U: UserStore,
    S: SessionStore,
    E: SecurityEventStore,
    M: Mailer,
{
    /// Clear a lockout ahead of its expiry. Resets the counter, the lock
    /// timestamp and the backoff strikes in one step.
    #[tracing::instrument(skip(self, device), fields(user_id = %user_id))]
    pub async fn admin_unlock(&self, user_id: Uuid, device: &DeviceInfo) -> AuthResult<()> {
        let found = self.store_call(self.users.find_user_by_id(user_id)).await?;
        let Some(mut user) = found else {
            return Err(AuthError::Validation("no such account".to_string()));
        };

        if self.lockout.reset(&mut user) {
            self.store_call(self.users.update_user(&user)).await?;
        }

        self.emit(
            SecurityEventKind::AccountUnlocked,
            Some(user.id),
            json!({ "by": "admin" }),
            device,
        )
        .await;
        tracing::info!(user_id = %user.id, "account unlocked by administrator");
        Ok(())
    }

    /// Log the account out everywhere. Returns how many sessions died.
    #[tracing::instrument(skip(self, device), fields(user_id = %user_id))]
    pub async fn revoke_all_sessions(&self, user_id: Uuid, device: &DeviceInfo) -> AuthResult<u64> {
        let revoked = self
            .store_call(self.sessions.revoke_all_sessions_for_user(user_id))
            .await?;

        if revoked > 0 {
            self.emit(
                SecurityEventKind::Logout,
                Some(user_id),
                json!({ "scope": "all", "sessions_revoked": revoked }),
                device,
            )
            .await;
        }
        tracing::info!(user_id = %user_id, revoked, "revoked all sessions");
        Ok(revoked)
    }
}
