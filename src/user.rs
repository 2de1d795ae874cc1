//! User identity model
//!
//! Defines the [`User`] record persisted by a [`UserStore`](crate::store::UserStore)
//! implementation, the platform [`Role`] hierarchy, and the bitflag
//! [`Permissions`] snapshot that gets embedded into issued tokens.
//!
//! The authentication core treats permissions as an opaque bit set: it
//! snapshots them into claims at issuance and never interprets individual
//! bits. Feature code downstream decides what each bit means.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Permissions
// ============================================================================

bitflags::bitflags! {
    /// Permission bits carried in token claims.
    ///
    /// Stored as a u64 bitfield. New permissions must be appended with fresh
    /// bit positions; existing positions are frozen because issued tokens
    /// embed the raw value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u64 {
        // Documents
        const VIEW_DOCUMENTS        = 1 << 0;
        const UPLOAD_DOCUMENTS      = 1 << 1;
        const MANAGE_DOCUMENTS      = 1 << 2;

        // Contacts
        const VIEW_CONTACTS         = 1 << 3;
        const MANAGE_CONTACTS       = 1 << 4;

        // Campaigns
        const VIEW_CAMPAIGNS        = 1 << 5;
        const MANAGE_CAMPAIGNS      = 1 << 6;

        // Analytics
        const VIEW_ANALYTICS        = 1 << 7;
        const EXPORT_ANALYTICS      = 1 << 8;

        // Agency administration
        const MANAGE_AGENCY_USERS   = 1 << 9;
        const MANAGE_AGENCY         = 1 << 10;
        const MANAGE_BILLING        = 1 << 11;

        // Platform administration (super-admin only)
        const MANAGE_PLATFORM       = 1 << 12;
    }
}

impl Permissions {
    /// Read-only access across the feature surface
    pub const VIEWER_DEFAULT: Self = Self::VIEW_DOCUMENTS
        .union(Self::VIEW_CONTACTS)
        .union(Self::VIEW_CAMPAIGNS)
        .union(Self::VIEW_ANALYTICS);

    /// Viewer plus day-to-day data entry
    pub const ASSISTANT_DEFAULT: Self = Self::VIEWER_DEFAULT
        .union(Self::UPLOAD_DOCUMENTS)
        .union(Self::MANAGE_CONTACTS);

    /// Full working set for an individual agent
    pub const AGENT_DEFAULT: Self = Self::ASSISTANT_DEFAULT
        .union(Self::MANAGE_DOCUMENTS)
        .union(Self::MANAGE_CAMPAIGNS)
        .union(Self::EXPORT_ANALYTICS);

    /// Agent plus user administration within the agency
    pub const AGENCY_ADMIN_DEFAULT: Self = Self::AGENT_DEFAULT.union(Self::MANAGE_AGENCY_USERS);

    /// Everything an agency can do, including settings and billing
    pub const AGENCY_OWNER_DEFAULT: Self = Self::AGENCY_ADMIN_DEFAULT
        .union(Self::MANAGE_AGENCY)
        .union(Self::MANAGE_BILLING);

    /// Check if this permission set contains a specific permission
    #[must_use]
    pub const fn has(&self, permission: Self) -> bool {
        self.contains(permission)
    }

    /// Create from a raw value as stored by a backend (unknown bits dropped)
    #[must_use]
    pub const fn from_db(value: u64) -> Self {
        Self::from_bits_truncate(value)
    }

    /// Raw value for storage
    #[must_use]
    pub const fn to_db(&self) -> u64 {
        self.bits()
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Roles
// ============================================================================

/// Platform role attached to every user.
///
/// Roles are ordered from most to least privileged. The core never branches
/// on role semantics beyond picking default permission presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    SuperAdmin,
    AgencyOwner,
    AgencyAdmin,
    Agent,
    Assistant,
    Viewer,
}

impl Role {
    /// Stable string form, matching the serde representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "super-admin",
            Self::AgencyOwner => "agency-owner",
            Self::AgencyAdmin => "agency-admin",
            Self::Agent => "agent",
            Self::Assistant => "assistant",
            Self::Viewer => "viewer",
        }
    }

    /// Default permission preset granted at account creation
    #[must_use]
    pub const fn default_permissions(&self) -> Permissions {
        match self {
            Self::SuperAdmin => Permissions::all(),
            Self::AgencyOwner => Permissions::AGENCY_OWNER_DEFAULT,
            Self::AgencyAdmin => Permissions::AGENCY_ADMIN_DEFAULT,
            Self::Agent => Permissions::AGENT_DEFAULT,
            Self::Assistant => Permissions::ASSISTANT_DEFAULT,
            Self::Viewer => Permissions::VIEWER_DEFAULT,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Backup codes
// ============================================================================

/// One MFA backup code, stored hashed.
///
/// Codes are single-use: `used_at` is set the moment a code is consumed and
/// a second presentation of the same code is treated as suspicious.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCode {
    /// SHA-256 hex digest of the plaintext code
    pub code_hash: String,
    /// When the code was consumed, if ever
    pub used_at: Option<DateTime<Utc>>,
}

impl BackupCode {
    #[must_use]
    pub const fn new(code_hash: String) -> Self {
        Self {
            code_hash,
            used_at: None,
        }
    }

    #[must_use]
    pub const fn is_used(&self) -> bool {
        self.used_at.is_some()
    }
}

// ============================================================================
// User model
// ============================================================================

/// A user account as persisted by the backing store.
///
/// Lockout invariant: `locked_until` is only ever set while
/// `failed_login_attempts` has reached the configured threshold, and both
/// are cleared together (on success, expiry, or admin unlock).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Always stored lowercase; see [`normalize_email`]
    pub email: String,
    /// Argon2id PHC string; `None` for accounts without a local password
    pub password_hash: Option<String>,
    pub is_verified: bool,
    pub is_active: bool,
    pub role: Role,
    pub permissions: Permissions,
    /// Owning agency; `None` for platform-level accounts
    pub agency_id: Option<Uuid>,

    // MFA state
    pub mfa_enabled: bool,
    /// AES-256-GCM encrypted TOTP secret (active)
    pub mfa_secret: Option<String>,
    /// Encrypted TOTP secret awaiting setup confirmation
    pub mfa_pending_secret: Option<String>,
    pub mfa_backup_codes: Vec<BackupCode>,

    // Lockout state
    pub failed_login_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    /// Consecutive lock events, drives exponential backoff when enabled
    pub lockout_strikes: i32,

    // Password reset
    pub password_reset_token_hash: Option<String>,
    pub password_reset_expires_at: Option<DateTime<Utc>>,

    // Email verification
    pub email_verification_token_hash: Option<String>,
    pub email_verification_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a new account with role-default permissions.
    ///
    /// The email is normalized and the record starts unverified, active,
    /// without MFA and with clean lockout state.
    #[must_use]
    pub fn new(email: &str, password_hash: Option<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            email: normalize_email(email),
            password_hash,
            is_verified: false,
            is_active: true,
            role,
            permissions: role.default_permissions(),
            agency_id: None,
            mfa_enabled: false,
            mfa_secret: None,
            mfa_pending_secret: None,
            mfa_backup_codes: Vec::new(),
            failed_login_attempts: 0,
            locked_until: None,
            lockout_strikes: 0,
            password_reset_token_hash: None,
            password_reset_expires_at: None,
            email_verification_token_hash: None,
            email_verification_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Public projection, safe to hand to clients
    #[must_use]
    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            email: self.email.clone(),
            role: self.role,
            permissions: self.permissions,
            agency_id: self.agency_id,
            is_verified: self.is_verified,
            mfa_enabled: self.mfa_enabled,
            created_at: self.created_at,
        }
    }

    /// Count of backup codes that are still usable
    #[must_use]
    pub fn remaining_backup_codes(&self) -> usize {
        self.mfa_backup_codes.iter().filter(|c| !c.is_used()).count()
    }
}

/// Client-facing view of a user, with no credential or lockout fields
#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub permissions: Permissions,
    pub agency_id: Option<Uuid>,
    pub is_verified: bool,
    pub mfa_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Canonical form used for all email comparisons and storage: trimmed and
/// lowercased. Lookups must normalize before hitting the store.
#[must_use]
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}
