use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{error, info, warn};
use uuid::Uuid;

use chirper_types::{AuthError, AuthSession, Claims, Identity};

use crate::Backend;

impl Backend {
    /// Create an email/password account and sign it in.
    ///
    /// Blocking: hashes with Argon2id and touches the database.
    pub fn create_account(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let email = normalize_email(email)?;
        let min_len = self.config().min_password_len;
        if password.chars().count() < min_len {
            return Err(AuthError::WeakPassword(min_len));
        }

        let db = self.db();
        if db
            .get_account_by_email(&email)
            .map_err(internal)?
            .is_some()
        {
            return Err(AuthError::EmailInUse);
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .to_string();

        let uid = Uuid::new_v4().simple().to_string();

        // The UNIQUE constraint catches a concurrent sign-up with the same email.
        if !db.create_account(&uid, &email, &password_hash).map_err(internal)? {
            warn!("Sign-up raced for {}", email);
            return Err(AuthError::EmailInUse);
        }

        info!("Account {} created for {}", uid, email);
        self.issue_session(uid, email)
    }

    /// Blocking: verifies the Argon2 hash.
    pub fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let email = normalize_email(email)?;
        let account = self
            .db()
            .get_account_by_email(&email)
            .map_err(internal)?
            .ok_or(AuthError::InvalidCredentials)?;

        let parsed_hash = PasswordHash::new(&account.password)
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|_| AuthError::InvalidCredentials)?;

        info!("{} signed in", account.id);
        self.issue_session(account.id, account.email)
    }

    /// Validate a session token and check the account still exists.
    pub fn verify_token(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.decode_token(token)?;
        if self
            .db()
            .get_account_by_id(&claims.sub)
            .map_err(internal)?
            .is_none()
        {
            return Err(AuthError::InvalidToken);
        }
        Ok(Identity::from(&claims))
    }

    /// Delete the account the token belongs to.
    pub fn delete_account(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.decode_token(token)?;
        if !self.db().delete_account(&claims.sub).map_err(internal)? {
            return Err(AuthError::InvalidToken);
        }
        info!("Account {} deleted", claims.sub);
        Ok(())
    }

    /// Signature and expiry check only, no database access.
    pub(crate) fn decode_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config().jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|_| AuthError::InvalidToken)
    }

    fn issue_session(&self, uid: String, email: String) -> Result<AuthSession, AuthError> {
        let token = create_token(&self.config().jwt_secret, self.config().token_ttl, &uid, &email)
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        Ok(AuthSession {
            identity: Identity { uid, email },
            token,
        })
    }
}

fn create_token(
    secret: &str,
    ttl: chrono::Duration,
    uid: &str,
    email: &str,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: uid.to_string(),
        email: email.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(email.to_lowercase())
        }
        _ => Err(AuthError::InvalidEmail),
    }
}

fn internal(e: anyhow::Error) -> AuthError {
    error!("auth database error: {}", e);
    AuthError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendConfig;

    fn backend() -> Backend {
        Backend::open(BackendConfig::default()).unwrap()
    }

    #[test]
    fn email_validation() {
        assert_eq!(normalize_email(" Ada@Example.com ").unwrap(), "ada@example.com");
        assert_eq!(normalize_email("nope"), Err(AuthError::InvalidEmail));
        assert_eq!(normalize_email("@x"), Err(AuthError::InvalidEmail));
        assert_eq!(normalize_email("a@b@c"), Err(AuthError::InvalidEmail));
    }

    #[test]
    fn sign_up_then_sign_in() {
        let backend = backend();
        let created = backend.create_account("ada@example.com", "hunter22").unwrap();
        assert_eq!(created.identity.email, "ada@example.com");

        let signed_in = backend.sign_in("ADA@example.com", "hunter22").unwrap();
        assert_eq!(signed_in.identity, created.identity);
        assert_eq!(backend.verify_token(&signed_in.token).unwrap(), created.identity);
    }

    #[test]
    fn sign_up_errors() {
        let backend = backend();
        assert_eq!(
            backend.create_account("ada@example.com", "short").unwrap_err(),
            AuthError::WeakPassword(6)
        );
        backend.create_account("ada@example.com", "hunter22").unwrap();
        assert_eq!(
            backend.create_account("ada@example.com", "other-pass").unwrap_err(),
            AuthError::EmailInUse
        );
    }

    #[test]
    fn storage_failure_is_not_reported_as_email_in_use() {
        let backend = backend();
        backend
            .db()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER refuse_accounts BEFORE INSERT ON accounts
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            backend.create_account("ada@example.com", "hunter22"),
            Err(AuthError::Internal(_))
        ));
    }

    #[test]
    fn bad_credentials_and_tokens() {
        let backend = backend();
        backend.create_account("ada@example.com", "hunter22").unwrap();

        assert_eq!(
            backend.sign_in("ada@example.com", "wrong-pass").unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            backend.sign_in("bob@example.com", "hunter22").unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(backend.verify_token("garbage").unwrap_err(), AuthError::InvalidToken);
    }

    #[test]
    fn deleted_account_invalidates_token() {
        let backend = backend();
        let session = backend.create_account("ada@example.com", "hunter22").unwrap();
        backend.delete_account(&session.token).unwrap();

        assert_eq!(backend.verify_token(&session.token).unwrap_err(), AuthError::InvalidToken);
        assert_eq!(
            backend.sign_in("ada@example.com", "hunter22").unwrap_err(),
            AuthError::InvalidCredentials
        );
    }
}
