//! `NodeControl` over the `nodetool` command line.

use super::NodeControl;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

pub struct Nodetool {
    binary: PathBuf,
    host: Option<String>,
    port: Option<u16>,
}

impl Nodetool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            host: None,
            port: None,
        }
    }

    pub fn with_endpoint(mut self, host: Option<String>, port: Option<u16>) -> Self {
        self.host = host;
        self.port = port;
        self
    }

    fn args(&self, command: &[&str]) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(host) = &self.host {
            args.extend(["-h".to_string(), host.clone()]);
        }
        if let Some(port) = self.port {
            args.extend(["-p".to_string(), port.to_string()]);
        }
        args.extend(command.iter().map(|s| s.to_string()));
        args
    }

    async fn run(&self, command: &[&str]) -> Result<String> {
        let args = self.args(command);
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| {
                BackupError::ControlChannel(format!("cannot run {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            return Err(BackupError::ControlChannel(format!(
                "nodetool {} exited with {}: {}",
                command.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl NodeControl for Nodetool {
    async fn take_snapshot(
        &self,
        keyspaces: &[String],
        tag: &str,
        table: Option<&str>,
    ) -> Result<()> {
        let command = snapshot_command(keyspaces, tag, table)?;
        self.run(&command).await.map(|_| ())
    }

    async fn clear_snapshot(&self, tag: &str) -> Result<()> {
        self.run(&["clearsnapshot", "-t", tag]).await.map(|_| ())
    }

    async fn drain(&self) -> Result<()> {
        self.run(&["drain"]).await.map(|_| ())
    }

    async fn get_tokens(&self) -> Result<Vec<String>> {
        let stdout = self.run(&["info", "--tokens"]).await?;
        let tokens = parse_info_tokens(&stdout);
        if tokens.is_empty() {
            return Err(BackupError::ControlChannel(
                "nodetool info reported no tokens".to_string(),
            ));
        }
        Ok(tokens)
    }
}

/// Arguments of `nodetool snapshot`. A table filter names exactly one keyspace.
fn snapshot_command<'a>(
    keyspaces: &'a [String],
    tag: &'a str,
    table: Option<&'a str>,
) -> Result<Vec<&'a str>> {
    let mut command = vec!["snapshot", "-t", tag];
    if let Some(table) = table {
        if keyspaces.len() != 1 {
            return Err(BackupError::Config(format!(
                "table {table} must be snapshotted within exactly one keyspace, got {}",
                keyspaces.len()
            )));
        }
        command.extend(["-cf", table]);
    }
    command.extend(keyspaces.iter().map(String::as_str));
    Ok(command)
}

/// Extract the `Token : <value>` lines of `nodetool info --tokens`.
pub fn parse_info_tokens(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (label, value) = line.split_once(':')?;
            (label.trim() == "Token").then(|| value.trim().to_string())
        })
        .filter(|token| !token.is_empty())
        .collect()
}
