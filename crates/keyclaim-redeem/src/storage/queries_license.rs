//! Local license account mirror queries.

use super::db::{DatabaseError, KeyDatabase};
use super::models::LicenseUser;

impl KeyDatabase {
    /// Insert or replace the cached account for an identity.
    pub async fn upsert_license_user(&self, user: &LicenseUser) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO license_users (discord_id, user_key, auth_expire, note, status, banned, synced_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(discord_id) DO UPDATE SET \
               user_key = excluded.user_key, \
               auth_expire = excluded.auth_expire, \
               note = excluded.note, \
               status = excluded.status, \
               banned = excluded.banned, \
               synced_at = excluded.synced_at",
        )
        .bind(&user.discord_id)
        .bind(&user.user_key)
        .bind(user.auth_expire)
        .bind(&user.note)
        .bind(&user.status)
        .bind(user.banned)
        .bind(user.synced_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_license_user(
        &self,
        discord_id: &str,
    ) -> Result<Option<LicenseUser>, DatabaseError> {
        let user =
            sqlx::query_as::<_, LicenseUser>("SELECT * FROM license_users WHERE discord_id = ?")
                .bind(discord_id)
                .fetch_optional(self.pool())
                .await?;

        Ok(user)
    }

    pub async fn get_license_user_by_key(
        &self,
        user_key: &str,
    ) -> Result<Option<LicenseUser>, DatabaseError> {
        let user = sqlx::query_as::<_, LicenseUser>("SELECT * FROM license_users WHERE user_key = ?")
            .bind(user_key)
            .fetch_optional(self.pool())
            .await?;

        Ok(user)
    }
}
