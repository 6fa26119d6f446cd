use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Database;
use crate::models::Connection;

impl Database {
    pub async fn find_connection(&self, id: Uuid) -> Result<Option<Connection>, sqlx::Error> {
        sqlx::query_as::<_, Connection>(
            "SELECT id, user_id, access_token, refresh_token, token_key_id, expires_at,
                    created_at, updated_at
             FROM connections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool())
        .await
    }

    pub async fn insert_connection(&self, connection: &Connection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO connections
                 (id, user_id, access_token, refresh_token, token_key_id, expires_at,
                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(connection.id)
        .bind(&connection.user_id)
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(&connection.token_key_id)
        .bind(connection.expires_at)
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .execute(&self.pool())
        .await?;

        Ok(())
    }

    /// Persist a freshly refreshed token pair. Only ever called by the token
    /// lifecycle manager after a successful provider refresh.
    pub async fn update_connection_tokens(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE connections
             SET access_token = $2, refresh_token = $3, expires_at = $4, updated_at = $5
             WHERE id = $1",
        )
        .bind(id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool())
        .await?;

        Ok(())
    }
}
