// The source-host side of the engine, driven over ssh
//
// Everything the engine needs from the source host goes through one ssh
// invocation shape: snapshot creation, send streams, directory listings and
// the metadata reads. Remote commands run as root; key-based auth is assumed
// (BatchMode forbids password prompts inside a backup run).

use std::collections::BTreeSet;
use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::REMOTE_SNAPSHOT_ROOT;

#[derive(Debug, Clone)]
pub struct Remote {
    host: String,
}

impl Remote {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
        }
    }

    /// ssh invocation running `remote_cmd` through the remote root shell
    pub fn command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectTimeout=30")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg(format!("root@{}", self.host))
            .arg(remote_cmd);
        cmd
    }

    /// Run a remote command, streaming its output through to our stderr
    pub fn run(&self, remote_cmd: &str) -> Result<()> {
        let status = self
            .command(remote_cmd)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("Failed to reach {} over ssh", self.host))?;

        if !status.success() {
            bail!("remote command failed on {}: {}", self.host, remote_cmd);
        }
        Ok(())
    }

    /// Run a remote command and collect its stdout
    pub fn capture(&self, remote_cmd: &str) -> Result<Vec<u8>> {
        let output = self
            .command(remote_cmd)
            .output()
            .with_context(|| format!("Failed to reach {} over ssh", self.host))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "remote command failed on {}: {}: {}",
                self.host,
                remote_cmd,
                stderr.trim()
            );
        }
        Ok(output.stdout)
    }

    /// Create the read-only snapshot `<root>/<name>` of the remote rootfs
    pub fn create_snapshot(&self, name: &str) -> Result<()> {
        log::info!("Creating remote snapshot {} on {}", name, self.host);
        self.run(&format!(
            "mkdir -p {root} && btrfs subvolume snapshot -r / {root}/{name}",
            root = REMOTE_SNAPSHOT_ROOT,
            name = name,
        ))
    }

    /// Names present in the remote snapshot directory
    pub fn list_snapshots(&self) -> Result<BTreeSet<String>> {
        let out = self.capture(&format!(
            "mkdir -p {root} && ls -1 {root}",
            root = REMOTE_SNAPSHOT_ROOT
        ))?;
        let text =
            String::from_utf8(out).context("remote snapshot listing is not valid UTF-8")?;
        Ok(text.lines().map(str::to_string).collect())
    }

    /// Spawn the send side of a transfer: `btrfs send` (full, or
    /// differential against `parent`) piped through the compressor on the
    /// remote host. The compressed stream arrives on the child's stdout.
    ///
    /// pipefail makes the remote shell report a failed send even though the
    /// compressor is the last stage of the remote pipe.
    pub fn spawn_send(
        &self,
        name: &str,
        parent: Option<&str>,
        compress: &[String],
    ) -> Result<Child> {
        let send = match parent {
            Some(parent) => format!(
                "btrfs send -p {root}/{parent} {root}/{name}",
                root = REMOTE_SNAPSHOT_ROOT,
                parent = parent,
                name = name,
            ),
            None => format!("btrfs send {root}/{name}", root = REMOTE_SNAPSHOT_ROOT, name = name),
        };

        let remote_cmd = format!("set -o pipefail; {} | {}", send, compress.join(" "));

        self.command(&remote_cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start send from {}", self.host))
    }
}
