//! `zfs` CLI gateway
//!
//! Drives the privileged zfs binary with parseable output flags. Every
//! failure is wrapped with the operation and dataset so callers can surface
//! it as metadata.

use crate::gateway::{DatasetGateway, SnapshotInfo};
use async_trait::async_trait;
use rodent_core::{Error, Result};
use std::collections::HashMap;
use tokio::process::Command;
use tracing::debug;

/// Production gateway shelling out to `zfs`.
#[derive(Debug, Clone)]
pub struct ZfsCli {
    binary: String,
}

impl ZfsCli {
    pub fn new() -> Self {
        Self {
            binary: "zfs".to_string(),
        }
    }

    /// Override the binary path (e.g. a wrapper script).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, operation: &str, dataset: &str, args: &[String]) -> Result<String> {
        debug!("zfs {}", args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::gateway(operation, dataset, e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::gateway(
                operation,
                dataset,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

impl Default for ZfsCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatasetGateway for ZfsCli {
    async fn create_snapshot(
        &self,
        dataset: &str,
        short_name: &str,
        recursive: bool,
        properties: &HashMap<String, String>,
    ) -> Result<()> {
        let mut args = vec!["snapshot".to_string()];
        if recursive {
            args.push("-r".to_string());
        }
        for (key, value) in properties {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(format!("{}@{}", dataset, short_name));

        self.run("create_snapshot", dataset, &args).await?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        dataset: &str,
        recursive: bool,
    ) -> Result<HashMap<String, SnapshotInfo>> {
        let mut args = vec![
            "list".to_string(),
            "-H".to_string(),
            "-p".to_string(),
            "-t".to_string(),
            "snapshot".to_string(),
            "-o".to_string(),
            "name,creation".to_string(),
        ];
        if recursive {
            args.push("-r".to_string());
        }
        args.push(dataset.to_string());

        let stdout = self.run("list_snapshots", dataset, &args).await?;
        Ok(parse_snapshot_list(&stdout))
    }

    async fn destroy_snapshot(&self, full_name: &str, force: bool) -> Result<()> {
        let dataset = full_name.split('@').next().unwrap_or(full_name).to_string();
        let mut args = vec!["destroy".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(full_name.to_string());

        self.run("destroy_snapshot", &dataset, &args).await?;
        Ok(())
    }
}

/// Parse `zfs list -Hp -o name,creation` output: one tab-separated
/// `name<TAB>creation-epoch` pair per line.
fn parse_snapshot_list(stdout: &str) -> HashMap<String, SnapshotInfo> {
    let mut snapshots = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let Some(name) = fields.next() else { continue };
        let creation = fields.next().unwrap_or_default();
        let mut info = SnapshotInfo::default();
        info.properties
            .insert("creation".to_string(), creation.to_string());
        snapshots.insert(name.to_string(), info);
    }
    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_list() {
        let out = "tank/data@auto-1\t1715784645\ntank/data@auto-2\t1715784648\n";
        let parsed = parse_snapshot_list(out);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["tank/data@auto-1"].creation(), Some(1715784645));
    }

    #[test]
    fn test_parse_snapshot_list_skips_blank_lines() {
        let parsed = parse_snapshot_list("\n\ntank/a@s\t10\n\n");
        assert_eq!(parsed.len(), 1);
    }
}
