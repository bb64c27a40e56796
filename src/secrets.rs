//! Secrets loaded at startup. See [`Secrets::initialize()`].

use std::{env::VarError, path::Path};

use eyre::Context;
use secrecy::SecretString;

/// Secrets necessary for the operation of this application.
pub struct Secrets {
    /// Bearer token presented to the document store.
    pub store_token: Option<SecretString>,
}

/// Read a secret from the environment variable `var` (whose lookup result is `value`), falling
/// back to the file `secrets_dir/file_name`.
async fn read_secret(
    secrets_dir: &Path,
    var: &str,
    value: Result<String, VarError>,
    file_name: &str,
) -> eyre::Result<Option<SecretString>> {
    match value {
        Ok(secret) => {
            tracing::info!("Secret was read from {} environment variable", var);
            Ok(Some(SecretString::new(secret)))
        }
        Err(VarError::NotPresent) => {
            let secret_path = secrets_dir.join(file_name);
            if !secret_path.is_file() {
                return Ok(None);
            }
            tracing::info!("Reading secret from file: {:?}", secret_path);
            let secret = tokio::fs::read_to_string(&secret_path)
                .await
                .wrap_err_with(|| format!("Error while reading secret file {:?}", secret_path))?;
            let stripped = secret.strip_suffix('\n').unwrap_or(&secret).to_string();
            Ok(Some(SecretString::new(stripped)))
        }
        Err(unexpected) => Err(unexpected)
            .wrap_err_with(|| format!("Error while reading {} environment variable", var)),
    }
}

impl Secrets {
    /// Load secrets:
    ///
    /// + `STORE_TOKEN`: Bearer token for the document store, read from the environment
    ///   variable, otherwise from `store_token` in `secrets_dir`. Requests are made without
    ///   authorization if it is unavailable.
    pub async fn initialize(secrets_dir: &Path) -> eyre::Result<Self> {
        if !secrets_dir.is_dir() {
            return Err(eyre::eyre!(
                "secrets_dir {:?} does not exist or is not a directory",
                secrets_dir
            ));
        }

        let store_token = read_secret(
            secrets_dir,
            "STORE_TOKEN",
            std::env::var("STORE_TOKEN"),
            "store_token",
        )
        .await?;
        if store_token.is_none() {
            tracing::warn!("STORE_TOKEN secret is unavailable, store requests are unauthenticated");
        }

        Ok(Self { store_token })
    }
}
