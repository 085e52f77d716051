//! Token file captured at backup time and the post-restore config artifacts.
//!
//! The file is YAML-flavoured plain text: a comment header and a single
//! `initial_token: <t1>,<t2>,...` line.

use crate::utils::{BackupError, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Key prefix of token files.
pub const TOKENS_PREFIX: &str = "tokens";

const INITIAL_TOKEN: &str = "initial_token";

/// File name of the restored token fragment inside the config directory.
pub const TOKENS_FRAGMENT: &str = "tokens.yaml";

/// File name of the fragment that disables auto bootstrap.
pub const AUTO_BOOTSTRAP_FRAGMENT: &str = "auto-bootstrap.yaml";

pub fn token_key(snapshot_tag: &str) -> String {
    format!("{TOKENS_PREFIX}/{snapshot_tag}-tokens.yaml")
}

pub fn render_token_file(tokens: &[String], snapshot_tag: &str) -> String {
    format!(
        "# Tokens owned by this node at snapshot {}\n# Apply before first start of a restored node\n{}: {}\n",
        snapshot_tag,
        INITIAL_TOKEN,
        tokens.join(",")
    )
}

pub fn parse_token_file(text: &str) -> Result<Vec<String>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix(INITIAL_TOKEN)?.trim_start().strip_prefix(':'))
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| BackupError::Manifest(format!("token file has no {INITIAL_TOKEN} line")))
}

/// Write the token fragment (verbatim) and the auto-bootstrap fragment into
/// `config_dir`. Returns the paths written.
pub async fn write_restore_artifacts(config_dir: &Path, token_file: &str) -> Result<Vec<PathBuf>> {
    let tokens = parse_token_file(token_file)?;
    tokio::fs::create_dir_all(config_dir).await?;

    let tokens_path = config_dir.join(TOKENS_FRAGMENT);
    tokio::fs::write(&tokens_path, token_file).await?;

    let bootstrap_path = config_dir.join(AUTO_BOOTSTRAP_FRAGMENT);
    tokio::fs::write(&bootstrap_path, "auto_bootstrap: false\n").await?;

    info!(
        "Wrote {} tokens and auto_bootstrap: false to {}",
        tokens.len(),
        config_dir.display()
    );
    Ok(vec![tokens_path, bootstrap_path])
}
