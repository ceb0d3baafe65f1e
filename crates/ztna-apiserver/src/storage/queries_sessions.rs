//! Session queries.

use super::db::Database;
use super::models::{Session, SessionRow, encode_list};
use ztna_core::db::DatabaseError;

const SELECT_SESSION: &str = "SELECT s.session_key, s.expiry, s.group_ids, s.object_id, d.* \
     FROM session s JOIN device d ON d.id = s.device_id";

impl Database {
    /// Persist a freshly minted session. The embedded device must exist.
    pub async fn add_session_info(&self, session: &Session) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO session (session_key, expiry, device_id, group_ids, object_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.key)
        .bind(session.expiry)
        .bind(session.device.id)
        .bind(encode_list(&session.groups))
        .bind(&session.object_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn read_session_info(&self, key: &str) -> Result<Session, DatabaseError> {
        sqlx::query_as::<_, SessionRow>(&format!("{SELECT_SESSION} WHERE s.session_key = ?"))
            .bind(key)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound("Session".to_string()))?
            .try_into()
    }

    /// Every persisted session, expired ones included.
    pub async fn read_session_infos(&self) -> Result<Vec<Session>, DatabaseError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!("{SELECT_SESSION} ORDER BY s.expiry"))
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(Session::try_from).collect()
    }

    /// The session with the latest expiry for a device.
    pub async fn read_most_recent_session_info(
        &self,
        device_id: i64,
    ) -> Result<Session, DatabaseError> {
        sqlx::query_as::<_, SessionRow>(&format!(
            "{SELECT_SESSION} WHERE s.device_id = ? ORDER BY s.expiry DESC LIMIT 1"
        ))
        .bind(device_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Session for device {device_id}")))?
        .try_into()
    }

    /// Delete sessions that expired before `now`. Returns the number removed.
    pub async fn remove_expired_sessions(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM session WHERE expiry < ?")
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
