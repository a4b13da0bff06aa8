//! In-memory `UserStore` for tests. The whole check-and-write runs under one lock,
//! standing in for the partial unique indexes the Postgres store relies on.
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo::{StoreError, UserStore};
use super::repo_types::{BasicUser, NewUser, PasswordChange, ProfileChanges, User};
use crate::error::ConflictField;

#[derive(Default)]
pub struct MemoryUserStore {
    rows: Mutex<Vec<User>>,
}

fn check_unique(
    rows: &[User],
    skip: Option<Uuid>,
    email: &str,
    username: &str,
) -> Result<(), StoreError> {
    let active = rows
        .iter()
        .filter(|u| !u.is_deleted() && Some(u.id) != skip);
    for u in active {
        if u.email == email {
            return Err(StoreError::Conflict(ConflictField::Email));
        }
        if u.username == username {
            return Err(StoreError::Conflict(ConflictField::Username));
        }
    }
    Ok(())
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn insert(&self, user: NewUser) -> Result<User, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        check_unique(&rows, None, &user.email, &user.username)?;
        let row = User {
            id: user.id,
            first_name: user.first_name,
            last_name: user.last_name,
            email: user.email,
            username: user.username,
            age: user.age,
            password_hash: user.password_hash,
            created_at: user.created_at,
            updated_at: user.created_at,
            last_login_at: None,
            deleted_at: None,
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn find_by_id(
        &self,
        id: Uuid,
        include_deleted: bool,
    ) -> Result<Option<User>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|u| u.id == id && (include_deleted || !u.is_deleted()))
            .cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|u| u.username == username && !u.is_deleted())
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|u| u.email == email && !u.is_deleted())
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<BasicUser>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|u| !u.is_deleted())
            .map(|u| BasicUser {
                id: u.id,
                username: u.username.clone(),
                first_name: u.first_name.clone(),
                last_name: u.last_name.clone(),
                email: u.email.clone(),
                age: u.age,
            })
            .collect())
    }

    async fn update(
        &self,
        id: Uuid,
        changes: &ProfileChanges,
        password: Option<&PasswordChange>,
        at: OffsetDateTime,
    ) -> Result<User, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let idx = rows
            .iter()
            .position(|u| u.id == id && !u.is_deleted())
            .ok_or(StoreError::NotFound)?;
        if let Some(p) = password {
            if rows[idx].password_hash != p.expected_hash {
                return Err(StoreError::StaleCredential);
            }
        }
        let email = changes.email.clone().unwrap_or_else(|| rows[idx].email.clone());
        let username = changes
            .username
            .clone()
            .unwrap_or_else(|| rows[idx].username.clone());
        check_unique(&rows, Some(id), &email, &username)?;

        let row = &mut rows[idx];
        if let Some(v) = &changes.first_name {
            row.first_name = v.clone();
        }
        if let Some(v) = &changes.last_name {
            row.last_name = v.clone();
        }
        if let Some(v) = changes.age {
            row.age = v;
        }
        if let Some(p) = password {
            row.password_hash = p.new_hash.clone();
        }
        row.email = email;
        row.username = username;
        row.updated_at = at;
        Ok(row.clone())
    }

    async fn record_login(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|u| u.id == id && !u.is_deleted())
            .ok_or(StoreError::NotFound)?;
        row.last_login_at = Some(at);
        row.updated_at = at;
        Ok(())
    }

    async fn soft_delete(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|u| u.id == id && !u.is_deleted())
            .ok_or(StoreError::NotFound)?;
        row.deleted_at = Some(at);
        row.updated_at = at;
        Ok(())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|u| u.id != id);
        if rows.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
