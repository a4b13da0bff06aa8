use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo_types::{BasicUser, NewUser, PasswordChange, ProfileChanges, User};
use crate::error::ConflictField;

/// Partial unique indexes from `migrations/0001_users.sql`.
const EMAIL_ACTIVE_KEY: &str = "users_email_active_key";
const USERNAME_ACTIVE_KEY: &str = "users_username_active_key";

const USER_COLUMNS: &str = "id, first_name, last_name, email, username, age, password_hash, \
                            created_at, updated_at, last_login_at, deleted_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} already in use")]
    Conflict(ConflictField),
    #[error("row not found")]
    NotFound,
    #[error("stored password changed concurrently")]
    StaleCredential,
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// Persistence for user rows. Uniqueness of email/username among active rows is
/// enforced by the store itself, never by a prior read.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, user: NewUser) -> Result<User, StoreError>;
    async fn find_by_id(&self, id: Uuid, include_deleted: bool)
        -> Result<Option<User>, StoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn list_active(&self) -> Result<Vec<BasicUser>, StoreError>;
    /// Applies profile changes to an active row. With `password`, the row is only
    /// updated while its hash still equals `expected_hash`.
    async fn update(
        &self,
        id: Uuid,
        changes: &ProfileChanges,
        password: Option<&PasswordChange>,
        at: OffsetDateTime,
    ) -> Result<User, StoreError>;
    async fn record_login(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError>;
    async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError>;
    async fn hard_delete(&self, id: Uuid) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// Maps a unique violation on one of the active-user indexes to a conflict.
fn map_write_error(err: sqlx::Error) -> StoreError {
    let field = match &err {
        sqlx::Error::Database(db_err) if db_err.code().is_some_and(|c| c.as_ref() == "23505") => {
            match db_err.constraint() {
                Some(EMAIL_ACTIVE_KEY) => Some(ConflictField::Email),
                Some(USERNAME_ACTIVE_KEY) => Some(ConflictField::Username),
                _ => None,
            }
        }
        _ => None,
    };
    match field {
        Some(field) => StoreError::Conflict(field),
        None => StoreError::Backend(err),
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn insert(&self, user: NewUser) -> Result<User, StoreError> {
        let query = format!(
            r#"
            INSERT INTO users (id, first_name, last_name, email, username, age, password_hash,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, User>(&query)
            .bind(user.id)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.email)
            .bind(&user.username)
            .bind(user.age)
            .bind(&user.password_hash)
            .bind(user.created_at)
            .fetch_one(&self.db)
            .await
            .map_err(map_write_error)
    }

    async fn find_by_id(
        &self,
        id: Uuid,
        include_deleted: bool,
    ) -> Result<Option<User>, StoreError> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND ($2 OR deleted_at IS NULL)"
        );
        let user = sqlx::query_as::<_, User>(&query)
            .bind(id)
            .bind(include_deleted)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 AND deleted_at IS NULL"
        );
        let user = sqlx::query_as::<_, User>(&query)
            .bind(username)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let query =
            format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND deleted_at IS NULL");
        let user = sqlx::query_as::<_, User>(&query)
            .bind(email)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn list_active(&self) -> Result<Vec<BasicUser>, StoreError> {
        let rows = sqlx::query_as::<_, BasicUser>(
            r#"
            SELECT id, username, first_name, last_name, email, age
            FROM users
            WHERE deleted_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn update(
        &self,
        id: Uuid,
        changes: &ProfileChanges,
        password: Option<&PasswordChange>,
        at: OffsetDateTime,
    ) -> Result<User, StoreError> {
        let query = format!(
            r#"
            UPDATE users SET
                first_name    = COALESCE($2, first_name),
                last_name     = COALESCE($3, last_name),
                email         = COALESCE($4, email),
                username      = COALESCE($5, username),
                age           = COALESCE($6, age),
                password_hash = COALESCE($7, password_hash),
                updated_at    = $9
            WHERE id = $1
              AND deleted_at IS NULL
              AND ($8::text IS NULL OR password_hash = $8)
            RETURNING {USER_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, User>(&query)
            .bind(id)
            .bind(changes.first_name.as_deref())
            .bind(changes.last_name.as_deref())
            .bind(changes.email.as_deref())
            .bind(changes.username.as_deref())
            .bind(changes.age)
            .bind(password.map(|p| p.new_hash.as_str()))
            .bind(password.map(|p| p.expected_hash.as_str()))
            .bind(at)
            .fetch_optional(&self.db)
            .await
            .map_err(map_write_error)?;

        match updated {
            Some(user) => Ok(user),
            None if password.is_some() && self.find_by_id(id, false).await?.is_some() => {
                Err(StoreError::StaleCredential)
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn record_login(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE users SET last_login_at = $2, updated_at = $2
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE users SET deleted_at = $2, updated_at = $2
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<(), StoreError> {
        let res = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
