//! Secure credential storage using the system keyring.
//!
//! Access tokens issued at sign-in and the SMTP password for outgoing mail
//! are kept in the platform's native credential storage:
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use keyring::Entry;
use tracing::{debug, warn};

use super::AccountId;

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "sorapc";

/// Credential type identifier for session access tokens.
const ACCESS_TOKEN_CREDENTIAL: &str = "access_token";

/// Credential type identifier for the outgoing mail password.
const SMTP_PASSWORD_CREDENTIAL: &str = "smtp_password";

/// Error type for credential operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Failed to access keyring.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// Account ID is required for credential operations.
    #[error("Account ID is required for credential storage")]
    MissingAccountId,
}

/// Result type for credential operations.
pub type CredentialResult<T> = std::result::Result<T, CredentialError>;

/// Generates the keyring entry key for a credential.
fn credential_key(account_id: &AccountId, credential_type: &str) -> String {
    format!("{SERVICE_NAME}_{credential_type}_{account_id}")
}

fn entry_for(account_id: &AccountId, credential_type: &str) -> CredentialResult<Entry> {
    if account_id.as_str().is_empty() {
        return Err(CredentialError::MissingAccountId);
    }
    let key = credential_key(account_id, credential_type);
    Ok(Entry::new(SERVICE_NAME, &key)?)
}

fn store(account_id: &AccountId, credential_type: &str, secret: &str) -> CredentialResult<()> {
    entry_for(account_id, credential_type)?.set_password(secret)?;
    debug!(account = %account_id, credential_type, "Stored credential");
    Ok(())
}

fn load(account_id: &AccountId, credential_type: &str) -> CredentialResult<Option<String>> {
    match entry_for(account_id, credential_type)?.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => {
            debug!(account = %account_id, credential_type, "No credential found");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn delete(account_id: &AccountId, credential_type: &str) -> CredentialResult<()> {
    match entry_for(account_id, credential_type)?.delete_credential() {
        Ok(()) => debug!(account = %account_id, credential_type, "Deleted credential"),
        Err(keyring::Error::NoEntry) => {
            debug!(account = %account_id, credential_type, "No credential to delete");
        }
        Err(e) => {
            warn!("Failed to delete {credential_type}: {e}");
            return Err(e.into());
        }
    }
    Ok(())
}

/// Stores the session access token in the system keyring.
///
/// # Errors
///
/// Returns an error if the account id is empty or the keyring operation fails.
pub fn store_access_token(account_id: &AccountId, token: &str) -> CredentialResult<()> {
    store(account_id, ACCESS_TOKEN_CREDENTIAL, token)
}

/// Retrieves the session access token from the system keyring.
///
/// # Errors
///
/// Returns an error if the account id is empty or the keyring operation fails.
pub fn load_access_token(account_id: &AccountId) -> CredentialResult<Option<String>> {
    load(account_id, ACCESS_TOKEN_CREDENTIAL)
}

/// Deletes the stored access token for an account.
///
/// Called on sign-out. A missing entry is not an error.
///
/// # Errors
///
/// Returns an error if the keyring operation fails (except for missing entries).
pub fn delete_access_token(account_id: &AccountId) -> CredentialResult<()> {
    delete(account_id, ACCESS_TOKEN_CREDENTIAL)
}

/// Stores the SMTP password used for outgoing mail.
///
/// # Errors
///
/// Returns an error if the account id is empty or the keyring operation fails.
pub fn store_smtp_password(account_id: &AccountId, password: &str) -> CredentialResult<()> {
    store(account_id, SMTP_PASSWORD_CREDENTIAL, password)
}

/// Retrieves the SMTP password, if one was stored.
///
/// # Errors
///
/// Returns an error if the account id is empty or the keyring operation fails.
pub fn load_smtp_password(account_id: &AccountId) -> CredentialResult<Option<String>> {
    load(account_id, SMTP_PASSWORD_CREDENTIAL)
}

/// Deletes the SMTP password. A missing entry is not an error.
///
/// # Errors
///
/// Returns an error if the keyring operation fails (except for missing entries).
pub fn delete_smtp_password(account_id: &AccountId) -> CredentialResult<()> {
    delete(account_id, SMTP_PASSWORD_CREDENTIAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_key_format() {
        let key = credential_key(&AccountId::new("uid-7"), ACCESS_TOKEN_CREDENTIAL);
        assert_eq!(key, "sorapc_access_token_uid-7");

        let key = credential_key(&AccountId::new("uid-7"), SMTP_PASSWORD_CREDENTIAL);
        assert_eq!(key, "sorapc_smtp_password_uid-7");
    }

    #[test]
    fn test_empty_account_id_is_rejected() {
        let result = store_access_token(&AccountId::default(), "token");
        assert!(matches!(result, Err(CredentialError::MissingAccountId)));

        let result = load_smtp_password(&AccountId::default());
        assert!(matches!(result, Err(CredentialError::MissingAccountId)));
    }
}
