//! Device queries.

use super::db::Database;
use super::models::{Device, NewDevice};
use ztna_core::db::DatabaseError;

impl Database {
    /// All devices, ordered by id.
    pub async fn read_devices(&self) -> Result<Vec<Device>, DatabaseError> {
        let devices = sqlx::query_as::<_, Device>("SELECT * FROM device ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(devices)
    }

    pub async fn read_device_by_id(&self, id: i64) -> Result<Device, DatabaseError> {
        sqlx::query_as::<_, Device>("SELECT * FROM device WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {id}")))
    }

    pub async fn read_device_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Device, DatabaseError> {
        sqlx::query_as::<_, Device>("SELECT * FROM device WHERE public_key = ?")
            .bind(public_key)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device with public key {public_key}")))
    }

    pub async fn read_device_by_serial_platform(
        &self,
        serial: &str,
        platform: &str,
    ) -> Result<Device, DatabaseError> {
        sqlx::query_as::<_, Device>("SELECT * FROM device WHERE serial = ? AND platform = ?")
            .bind(serial)
            .bind(platform)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {serial}/{platform}")))
    }

    /// Enroll a device, or refresh the owner and key of an already enrolled
    /// (serial, platform).
    ///
    /// Existing devices keep their tunnel IP, and keep their healthy flag
    /// unless `new.healthy` is set. New devices get the next free address.
    pub async fn add_device(&self, new: &NewDevice) -> Result<Device, DatabaseError> {
        let _guard = self.lock_enrollment().await;
        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query_as::<_, Device>(
            "SELECT * FROM device WHERE serial = ? AND platform = ?",
        )
        .bind(&new.serial)
        .bind(&new.platform)
        .fetch_optional(&mut *tx)
        .await?;

        let id = if let Some(existing) = existing {
            sqlx::query("UPDATE device SET username = ?, public_key = ?, healthy = ? WHERE id = ?")
                .bind(&new.username)
                .bind(&new.public_key)
                .bind(new.healthy.unwrap_or(existing.healthy))
                .bind(existing.id)
                .execute(&mut *tx)
                .await?;
            existing.id
        } else {
            let ip = self.allocate_ip(&mut tx).await?;
            sqlx::query(
                "INSERT INTO device (serial, platform, username, public_key, ip, healthy) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&new.serial)
            .bind(&new.platform)
            .bind(&new.username)
            .bind(&new.public_key)
            .bind(&ip)
            .bind(new.healthy.unwrap_or(false))
            .execute(&mut *tx)
            .await?
            .last_insert_rowid()
        };

        let device = sqlx::query_as::<_, Device>("SELECT * FROM device WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(device)
    }

    /// Write health and serial fields for a batch of devices in one transaction.
    ///
    /// An unknown device id rolls back the whole batch.
    pub async fn update_devices(&self, devices: &[Device]) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        for device in devices {
            let result = sqlx::query(
                "UPDATE device SET healthy = ?, serial = ?, last_updated = ?, last_seen = ? WHERE id = ?",
            )
            .bind(device.healthy)
            .bind(&device.serial)
            .bind(device.last_updated)
            .bind(device.last_seen)
            .bind(device.id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(DatabaseError::NotFound(format!("Device {}", device.id)));
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
