use anyhow::{Context, Result, anyhow};
use keyring::Entry;
use tracing::{debug, info};

/// Secret storage keyed by service and account.
pub(crate) trait CredentialStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>>;
    fn set(&self, service: &str, account: &str, secret: &str) -> Result<()>;
}

/// Platform keyring: Keychain, Credential Manager or Secret Service.
pub(crate) struct KeyringCredentials;

impl CredentialStore for KeyringCredentials {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>> {
        let entry = Entry::new(service, account).context("failed to open keyring entry")?;
        match entry.get_password() {
            Ok(secret) => {
                debug!(service, account, "password read from keyring");
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(anyhow!(err).context("failed to read keyring entry")),
        }
    }

    fn set(&self, service: &str, account: &str, secret: &str) -> Result<()> {
        let entry = Entry::new(service, account).context("failed to open keyring entry")?;
        entry
            .set_password(secret)
            .context("failed to write keyring entry")?;
        info!(service, account, "password stored in keyring");
        Ok(())
    }
}

/// A password in the config file wins over the keyring.
pub(crate) fn resolve_password(
    configured: Option<&str>,
    store: &dyn CredentialStore,
    service: &str,
    account: &str,
) -> Result<String> {
    if let Some(password) = configured.filter(|p| !p.is_empty()) {
        return Ok(password.to_string());
    }
    store.get(service, account)?.ok_or_else(|| {
        anyhow!(
            "no password for {} in config or keyring service {} (run `imapvault set-password`)",
            account,
            service
        )
    })
}
