//! Deployment hook execution (spec.md §4.5 steps 5/7/9).
//!
//! Hooks are optional scripts inside a release at
//! `.deployer/hooks/<phase>.sh`, run as the `deployer` user with the
//! deployment's environment preserved.

use std::collections::HashMap;
use std::time::Duration;

use crate::connection::{shell_quote, Connection, CommandResult, ExecuteOptions};
use crate::error::Result;

pub const DEPLOYER_USER: &str = "deployer";

/// Runs `<release_path>/.deployer/hooks/<phase>.sh` if it exists.
/// Returns `Ok(None)` when the hook is absent (not an error — hooks
/// are optional at every phase).
pub async fn run_hook(
    connection: &dyn Connection,
    release_path: &str,
    phase: &str,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> Result<Option<CommandResult>> {
    let hook_path = format!("{release_path}/.deployer/hooks/{phase}.sh");
    if !connection.path_exists(&hook_path).await? {
        return Ok(None);
    }

    connection
        .execute(
            &format!("chmod +x {}", shell_quote(&hook_path)),
            ExecuteOptions::new().with_timeout(timeout),
        )
        .await?;

    let env_prefix: String = env
        .iter()
        .map(|(k, v)| format!("{k}={} ", shell_quote(v)))
        .collect();
    let command = format!(
        "sudo -u {DEPLOYER_USER} env {env_prefix}bash {}",
        shell_quote(&hook_path)
    );

    let result = connection
        .execute(
            &command,
            ExecuteOptions::new()
                .with_cwd(release_path)
                .with_timeout(timeout),
        )
        .await?;
    Ok(Some(result))
}
