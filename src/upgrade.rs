//! Upgrade executor (§4.9): fetches an image over HTTP, verifies its
//! checksum, and pipes it into a spawned helper's stdin.
//!
//! Resolves REDESIGN FLAG R4 (was Q3): `sha256sum`, when present, is
//! verified against the downloaded image before any byte reaches the
//! child process's stdin.

use crate::error::{ProtocolError, TransportError};
use crate::types::{NodeName, UpgradeCommand};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

/// Run one upgrade command. Ignored (not an error) when a node filter is
/// present and doesn't name `local_node`.
pub async fn execute(
    argv: &[String],
    command: &UpgradeCommand,
    local_node: &NodeName,
    client: &reqwest::Client,
) -> Result<(), UpgradeError> {
    if !command.nodes.is_empty() && !command.nodes.iter().any(|n| n == &local_node.0) {
        info!(node = %local_node, "upgrade command does not target this node, ignoring");
        return Ok(());
    }

    let Some((program, args)) = argv.split_first() else {
        warn!("upgrade command received but no upgrade tool is configured");
        return Ok(());
    };

    let response = client
        .get(&command.url)
        .send()
        .await
        .map_err(TransportError::Http)?;
    if !response.status().is_success() {
        return Err(UpgradeError::Protocol(ProtocolError::MalformedUpgradeCommand(format!(
            "GET {} returned {}",
            command.url,
            response.status()
        ))));
    }
    let content_length = response.content_length();
    let body = response.bytes().await.map_err(TransportError::Http)?;

    if let Some(expected_hex) = &command.sha256sum {
        let mut hasher = Sha256::new();
        hasher.update(&body);
        let actual_hex = hex::encode(hasher.finalize());
        if &actual_hex != expected_hex {
            return Err(UpgradeError::Protocol(ProtocolError::UpgradeChecksumMismatch));
        }
    }

    let mut child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .spawn()
        .map_err(|e| UpgradeError::Protocol(ProtocolError::MalformedUpgradeCommand(e.to_string())))?;

    let mut stdin = child.stdin.take().ok_or_else(|| {
        UpgradeError::Protocol(ProtocolError::MalformedUpgradeCommand(
            "upgrade child produced no stdin pipe".to_string(),
        ))
    })?;
    let mut stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(body.clone())]).boxed();
    let mut bytes_copied: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            UpgradeError::Protocol(ProtocolError::MalformedUpgradeCommand(e.to_string()))
        })?;
        stdin
            .write_all(&chunk)
            .await
            .map_err(|e| UpgradeError::Protocol(ProtocolError::MalformedUpgradeCommand(e.to_string())))?;
        bytes_copied += chunk.len() as u64;
    }
    drop(stdin);

    if let Some(expected) = content_length {
        if bytes_copied != expected {
            warn!(bytes_copied, expected, "upgrade image truncated, aborting silently");
            return Err(UpgradeError::Protocol(ProtocolError::UpgradeSizeMismatch {
                piped: bytes_copied,
                expected,
            }));
        }
    }

    let _ = child.wait().await;
    info!(url = %command.url, bytes_copied, "upgrade image piped to tool");
    Ok(())
}

/// Upgrade-executor errors. No rollback, no retry — the spawned tool is
/// responsible for whatever it does with a partial or rejected image.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ignores_commands_targeting_other_nodes() {
        let command = UpgradeCommand {
            url: "http://unused.invalid/image".to_string(),
            sha256sum: None,
            nodes: vec!["other-node".to_string()],
        };
        let local_node = NodeName("this-node".to_string());
        let client = reqwest::Client::new();
        let result = execute(&["echo".to_string()], &command, &local_node, &client).await;
        assert!(result.is_ok());
    }
}
