use std::{fmt::Display, sync::Arc};

use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    dto::{RegisterRequest, UpdateUserRequest},
    repo::{StoreError, UserStore},
    repo_types::{BasicUser, NewUser, PasswordChange, ProfileChanges, User},
};
use crate::{
    auth::{
        delegate::{GeneratePasswordRequest, PasswordDelegate},
        dto::LoginRequest,
        jwt::TokenService,
        password::CredentialHasher,
    },
    error::{AppError, ConflictField},
};

/// Verified against when a login names an unknown user, so both failures cost one hash.
const TIMING_DUMMY_PASSWORD: &str = "timing-dummy-password";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(email: &str) -> Result<String, AppError> {
    let email = email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(AppError::Validation("invalid email".into()));
    }
    Ok(email)
}

fn normalize_username(username: &str) -> Result<String, AppError> {
    let username = username.trim();
    if username.is_empty() || username.chars().any(char::is_whitespace) {
        return Err(AppError::Validation("invalid username".into()));
    }
    Ok(username.to_string())
}

fn normalize_name(value: &str, field: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn validate_age(age: i32) -> Result<i32, AppError> {
    if !(1..=150).contains(&age) {
        return Err(AppError::Validation("age must be between 1 and 150".into()));
    }
    Ok(age)
}

/// Maps a store failure, logging backend errors with the operation and entity.
fn store_error(operation: &'static str, entity: impl Display, err: StoreError) -> AppError {
    match err {
        StoreError::Conflict(field) => AppError::Conflict(field),
        StoreError::NotFound => AppError::NotFound("user"),
        StoreError::StaleCredential => AppError::InvalidCredential,
        StoreError::Backend(e) => {
            error!(operation, entity = %entity, error = %e, "storage error");
            AppError::Storage(e.to_string())
        }
    }
}

/// The user directory: registration, lookup, profile and credential changes,
/// deletion and login.
pub struct UserDirectory {
    store: Arc<dyn UserStore>,
    hasher: CredentialHasher,
    passwords: PasswordDelegate,
    tokens: TokenService,
    dummy_hash: String,
}

impl UserDirectory {
    pub fn new(
        store: Arc<dyn UserStore>,
        hasher: CredentialHasher,
        passwords: PasswordDelegate,
        tokens: TokenService,
    ) -> Result<Self, AppError> {
        let dummy_hash = hasher.hash(TIMING_DUMMY_PASSWORD)?;
        Ok(Self {
            store,
            hasher,
            passwords,
            tokens,
            dummy_hash,
        })
    }

    #[instrument(skip(self, req), fields(username = %req.username))]
    pub async fn insert_user(&self, req: RegisterRequest) -> Result<User, AppError> {
        let email = normalize_email(&req.email)?;
        let username = normalize_username(&req.username)?;
        let first_name = normalize_name(&req.first_name, "first_name")?;
        let last_name = normalize_name(&req.last_name, "last_name")?;
        let age = validate_age(req.age)?;
        if req.password.is_empty() {
            return Err(AppError::Validation("password must not be empty".into()));
        }

        // Fast path only; the store's unique indexes decide.
        if self
            .store
            .find_by_email(&email)
            .await
            .map_err(|e| store_error("insert_user", &email, e))?
            .is_some()
        {
            warn!(email = %email, "email already registered");
            return Err(AppError::Conflict(ConflictField::Email));
        }
        if self
            .store
            .find_by_username(&username)
            .await
            .map_err(|e| store_error("insert_user", &username, e))?
            .is_some()
        {
            warn!("username already registered");
            return Err(AppError::Conflict(ConflictField::Username));
        }

        let password_hash = self
            .passwords
            .hash_password(&GeneratePasswordRequest {
                username: &username,
                first_name: &first_name,
                last_name: &last_name,
                age,
                email: &email,
                password: &req.password,
            })
            .await
            .map_err(|e| {
                error!(error = %e, strategy = self.passwords.kind(), "password hashing failed");
                AppError::from(e)
            })?;

        let id = Uuid::new_v4();
        let new_user = NewUser {
            id,
            first_name,
            last_name,
            email,
            username,
            age,
            password_hash,
            created_at: OffsetDateTime::now_utc(),
        };
        let user = self.store.insert(new_user).await.map_err(|e| {
            if let StoreError::Conflict(field) = &e {
                warn!(%field, "registration lost a uniqueness race");
            }
            store_error("insert_user", id, e)
        })?;

        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Active user by id, hash included. Callers strip the hash before responding.
    pub async fn get_user_by_id(&self, id: Uuid) -> Result<User, AppError> {
        self.store
            .find_by_id(id, false)
            .await
            .map_err(|e| store_error("get_user_by_id", id, e))?
            .ok_or(AppError::NotFound("user"))
    }

    /// Like [`Self::get_user_by_id`] but also finds soft-deleted rows.
    pub async fn get_user_by_id_including_deleted(&self, id: Uuid) -> Result<User, AppError> {
        self.store
            .find_by_id(id, true)
            .await
            .map_err(|e| store_error("get_user_by_id_including_deleted", id, e))?
            .ok_or(AppError::NotFound("user"))
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<User, AppError> {
        self.store
            .find_by_username(username.trim())
            .await
            .map_err(|e| store_error("get_user_by_username", username, e))?
            .ok_or(AppError::NotFound("user"))
    }

    pub async fn get_basic_user_data_list(&self) -> Result<Vec<BasicUser>, AppError> {
        self.store
            .list_active()
            .await
            .map_err(|e| store_error("get_basic_user_data_list", "users", e))
    }

    #[instrument(skip(self, req))]
    pub async fn update_user(&self, id: Uuid, req: UpdateUserRequest) -> Result<User, AppError> {
        let user = self.get_user_by_id(id).await?;

        let changes = ProfileChanges {
            first_name: req
                .first_name
                .as_deref()
                .map(|v| normalize_name(v, "first_name"))
                .transpose()?,
            last_name: req
                .last_name
                .as_deref()
                .map(|v| normalize_name(v, "last_name"))
                .transpose()?,
            email: req.email.as_deref().map(normalize_email).transpose()?,
            username: req.username.as_deref().map(normalize_username).transpose()?,
            age: req.age.map(validate_age).transpose()?,
        };

        let password = match (req.old_password, req.new_password) {
            (None, None) => None,
            (Some(old), Some(new)) => {
                if !self.verify(&user.password_hash, &old).await? {
                    warn!(user_id = %id, "password change with wrong old password");
                    return Err(AppError::InvalidCredential);
                }
                if self.verify(&user.password_hash, &new).await? {
                    return Err(AppError::DuplicatePassword);
                }
                let new_hash = self
                    .passwords
                    .hash_password(&GeneratePasswordRequest {
                        username: changes.username.as_deref().unwrap_or(&user.username),
                        first_name: changes.first_name.as_deref().unwrap_or(&user.first_name),
                        last_name: changes.last_name.as_deref().unwrap_or(&user.last_name),
                        age: changes.age.unwrap_or(user.age),
                        email: changes.email.as_deref().unwrap_or(&user.email),
                        password: &new,
                    })
                    .await?;
                Some(PasswordChange {
                    expected_hash: user.password_hash.clone(),
                    new_hash,
                })
            }
            _ => {
                return Err(AppError::Validation(
                    "old_password and new_password must be supplied together".into(),
                ))
            }
        };

        let updated = self
            .store
            .update(id, &changes, password.as_ref(), OffsetDateTime::now_utc())
            .await
            .map_err(|e| store_error("update_user", id, e))?;

        info!(user_id = %id, password_changed = password.is_some(), "user updated");
        Ok(updated)
    }

    /// Soft delete unless `hard`; a hard delete is permanent.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, id: Uuid, hard: bool) -> Result<(), AppError> {
        let user = self.get_user_by_id_including_deleted(id).await?;
        if !hard && user.is_deleted() {
            return Err(AppError::NotFound("user"));
        }
        if hard {
            self.store
                .hard_delete(id)
                .await
                .map_err(|e| store_error("hard_delete_user", id, e))?;
        } else {
            self.store
                .soft_delete(id, OffsetDateTime::now_utc())
                .await
                .map_err(|e| store_error("soft_delete_user", id, e))?;
        }
        info!(user_id = %id, hard, was_deleted = user.is_deleted(), "user deleted");
        Ok(())
    }

    /// Verifies credentials and issues a session token. Unknown user and wrong
    /// password both come back as `InvalidCredential`.
    #[instrument(skip(self, req), fields(username = %req.username))]
    pub async fn login(&self, req: LoginRequest) -> Result<(User, String), AppError> {
        let mut user = match self.get_user_by_username(&req.username).await {
            Ok(user) => user,
            Err(AppError::NotFound(_)) => {
                let _ = self.verify(&self.dummy_hash, &req.password).await;
                warn!("login unknown username");
                return Err(AppError::InvalidCredential);
            }
            Err(e) => return Err(e),
        };

        if !self.verify(&user.password_hash, &req.password).await? {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AppError::InvalidCredential);
        }

        let now = OffsetDateTime::now_utc();
        self.store
            .record_login(user.id, now)
            .await
            .map_err(|e| store_error("login", user.id, e))?;
        user.last_login_at = Some(now);
        user.updated_at = now;

        let token = self.tokens.issue(user.id).map_err(|e| {
            error!(error = %e, user_id = %user.id, "token issue failed");
            AppError::Internal(e.to_string())
        })?;

        info!(user_id = %user.id, "user logged in");
        Ok((user, token))
    }

    async fn verify(&self, hash: &str, plain: &str) -> Result<bool, AppError> {
        let hasher = self.hasher.clone();
        let hash = hash.to_owned();
        let plain = plain.to_owned();
        tokio::task::spawn_blocking(move || hasher.verify(&hash, &plain))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .map_err(AppError::from)
    }
}
