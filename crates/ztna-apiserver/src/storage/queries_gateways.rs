//! Gateway queries.

use super::db::Database;
use super::models::{Gateway, GatewayDynamicFields, GatewayParams, GatewayRow, encode_list};
use ztna_core::db::DatabaseError;

const SELECT_GATEWAY: &str = "SELECT name, public_key, endpoint, ip, access_group_ids, routes, \
     password_hash, requires_privileged_access FROM gateway";

impl Database {
    /// All gateways, ordered by name.
    pub async fn read_gateways(&self) -> Result<Vec<Gateway>, DatabaseError> {
        let rows = sqlx::query_as::<_, GatewayRow>(&format!("{SELECT_GATEWAY} ORDER BY name"))
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(Gateway::try_from).collect()
    }

    pub async fn read_gateway_by_name(&self, name: &str) -> Result<Gateway, DatabaseError> {
        sqlx::query_as::<_, GatewayRow>(&format!("{SELECT_GATEWAY} WHERE name = ?"))
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Gateway {name}")))?
            .try_into()
    }

    pub async fn read_gateway_by_public_key(&self, public_key: &str) -> Result<Gateway, DatabaseError> {
        sqlx::query_as::<_, GatewayRow>(&format!("{SELECT_GATEWAY} WHERE public_key = ?"))
            .bind(public_key)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Gateway with public key {public_key}")))?
            .try_into()
    }

    /// Enroll a new gateway with the next free tunnel address.
    ///
    /// Fails with `Conflict` if the name (or public key) is already enrolled.
    pub async fn add_gateway(&self, params: &GatewayParams) -> Result<Gateway, DatabaseError> {
        let _guard = self.lock_enrollment().await;
        let mut tx = self.pool().begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT name FROM gateway WHERE name = ?")
            .bind(&params.name)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            return Err(DatabaseError::Conflict(format!(
                "Gateway {} already enrolled",
                params.name
            )));
        }

        let ip = self.allocate_ip(&mut tx).await?;
        sqlx::query(
            "INSERT INTO gateway (name, public_key, endpoint, ip, access_group_ids, routes, password_hash, requires_privileged_access) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&params.name)
        .bind(&params.public_key)
        .bind(&params.endpoint)
        .bind(&ip)
        .bind(encode_list(&params.access_group_ids))
        .bind(encode_list(&params.routes))
        .bind(&params.password_hash)
        .bind(params.requires_privileged_access)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.read_gateway_by_name(&params.name).await
    }

    /// Rewrite every field of an enrolled gateway except its tunnel IP.
    pub async fn update_gateway(&self, params: &GatewayParams) -> Result<Gateway, DatabaseError> {
        let result = sqlx::query(
            "UPDATE gateway SET public_key = ?, endpoint = ?, access_group_ids = ?, routes = ?, \
             password_hash = ?, requires_privileged_access = ? WHERE name = ?",
        )
        .bind(&params.public_key)
        .bind(&params.endpoint)
        .bind(encode_list(&params.access_group_ids))
        .bind(encode_list(&params.routes))
        .bind(&params.password_hash)
        .bind(params.requires_privileged_access)
        .bind(&params.name)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Gateway {}", params.name)));
        }
        self.read_gateway_by_name(&params.name).await
    }

    /// Rewrite routes, access groups and the privileged flag only. Identity
    /// fields (key, endpoint, password) are never touched here.
    pub async fn update_gateway_dynamic_fields(
        &self,
        name: &str,
        fields: &GatewayDynamicFields,
    ) -> Result<Gateway, DatabaseError> {
        let result = sqlx::query(
            "UPDATE gateway SET access_group_ids = ?, routes = ?, requires_privileged_access = ? WHERE name = ?",
        )
        .bind(encode_list(&fields.access_group_ids))
        .bind(encode_list(&fields.routes))
        .bind(fields.requires_privileged_access)
        .bind(name)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Gateway {name}")));
        }
        self.read_gateway_by_name(name).await
    }
}
