//! The gate deciding whether this application may read the device location.
//! See [Port].

use std::io::Write;

use async_trait::async_trait;
use eyre::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

/// Outcome of a location permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Location may be read.
    Granted,
    /// Location must not be read.
    Denied,
}

/// How [`Gateway`] decides on permission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionPolicy {
    /// Always grant.
    Granted,
    /// Always deny.
    Denied,
    /// Ask the driver on the terminal.
    #[default]
    Prompt,
}

/// Trait used to allow mocking the permission gate.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Port: Send + Sync {
    /// Request permission to read the device location in the foreground.
    async fn request_location(&self) -> eyre::Result<Permission>;
}

/// Concrete implementation of [`Port`]. The decision is made once per process and remembered.
pub struct Gateway {
    policy: PermissionPolicy,
    decision: OnceCell<Permission>,
}

impl Gateway {
    /// Construct a new [`Gateway`].
    #[must_use]
    pub fn new(policy: PermissionPolicy) -> Self {
        Self {
            policy,
            decision: OnceCell::new(),
        }
    }
}

fn prompt() -> eyre::Result<Permission> {
    let mut stdout = std::io::stdout();
    write!(
        stdout,
        "Allow ambulance-driver to access this device's location? [y/N] "
    )?;
    stdout.flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .wrap_err("Error reading answer from stdin")?;
    Ok(parse_answer(&answer))
}

fn parse_answer(answer: &str) -> Permission {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Permission::Granted,
        _ => Permission::Denied,
    }
}

#[async_trait]
impl Port for Gateway {
    async fn request_location(&self) -> eyre::Result<Permission> {
        let permission = self
            .decision
            .get_or_try_init(|| async {
                match self.policy {
                    PermissionPolicy::Granted => Ok(Permission::Granted),
                    PermissionPolicy::Denied => Ok(Permission::Denied),
                    PermissionPolicy::Prompt => tokio::task::spawn_blocking(prompt)
                        .await
                        .wrap_err("Location permission prompt panicked")?,
                }
            })
            .await?;
        tracing::debug!("Location permission: {:?}", permission);
        Ok(*permission)
    }
}
