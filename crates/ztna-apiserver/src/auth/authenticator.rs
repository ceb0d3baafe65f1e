//! Device login: identity token in, session out.

use std::sync::Arc;

use argon2::password_hash::rand_core::{OsRng, RngCore};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::{info, instrument, warn};

use super::identity::IdentityProvider;
use super::AuthError;
use crate::sessions::{SessionStore, key_prefix};
use crate::storage::{Database, DatabaseError, Session};
use ztna_core::db::unix_timestamp;

pub const DEFAULT_SESSION_TTL_SECS: i64 = 10 * 60 * 60;

pub struct Authenticator {
    provider: Arc<dyn IdentityProvider>,
    db: Database,
    sessions: Arc<SessionStore>,
    required_group: String,
    session_ttl_secs: i64,
}

impl Authenticator {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        db: Database,
        sessions: Arc<SessionStore>,
        required_group: impl Into<String>,
        session_ttl_secs: i64,
    ) -> Self {
        Self {
            provider,
            db,
            sessions,
            required_group: required_group.into(),
            session_ttl_secs,
        }
    }

    pub fn provider(&self) -> &dyn IdentityProvider {
        self.provider.as_ref()
    }

    /// Validate `token`, check policy acceptance, bind to the enrolled device
    /// and persist a fresh session.
    #[instrument(skip(self, token), fields(provider = self.provider.kind()))]
    pub async fn login(
        &self,
        token: &str,
        serial: &str,
        platform: &str,
    ) -> Result<Session, AuthError> {
        let identity = self.provider.validate(token).await?;

        if !identity.groups.iter().any(|g| *g == self.required_group) {
            warn!(subject = %identity.subject, group = %self.required_group, "Login rejected, policy group missing");
            return Err(AuthError::MissingPolicyGroup(self.required_group.clone()));
        }

        let device = match self.db.read_device_by_serial_platform(serial, platform).await {
            Ok(device) => device,
            Err(DatabaseError::NotFound(_)) => {
                warn!(serial, platform, "Login rejected, device not enrolled");
                return Err(AuthError::UnknownDevice {
                    serial: serial.to_string(),
                    platform: platform.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if !identity.username.eq_ignore_ascii_case(&device.username) {
            warn!(
                device_id = device.id,
                owner = %device.username,
                identity = %identity.username,
                "Login identity does not match device owner"
            );
        }

        let session = Session {
            key: generate_session_key(),
            expiry: unix_timestamp() + self.session_ttl_secs,
            device,
            groups: identity.groups,
            object_id: identity.subject,
        };
        let session = self.sessions.set(session).await?;

        info!(
            session = %key_prefix(&session.key),
            device_id = session.device_id(),
            expiry = session.expiry,
            "Session created"
        );
        Ok(session)
    }
}

/// 32 random bytes, base64url without padding.
pub fn generate_session_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
