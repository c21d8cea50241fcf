use anyhow::{Context, Result};
use keyring::Entry;

/// Keychain service under which sign-in passwords are remembered
const SERVICE_NAME: &str = "fundflow";

/// Remembered sign-in passwords, keyed by email, in the OS keychain.
pub struct PasswordVault;

impl PasswordVault {
    pub fn remember(email: &str, password: &str) -> Result<()> {
        Self::entry(email)?
            .set_password(password)
            .context("Failed to store password in keychain")
    }

    /// The remembered password, if any
    pub fn recall(email: &str) -> Option<String> {
        Self::entry(email).ok()?.get_password().ok()
    }

    pub fn forget(email: &str) -> Result<()> {
        match Self::entry(email)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete password from keychain"),
        }
    }

    fn entry(email: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, email).context("Failed to create keyring entry")
    }
}
