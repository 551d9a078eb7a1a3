//! Generated OpenSSH client configuration
//!
//! Every machine that reaches its NAT-registration step records a `Host`
//! block in the cluster's `ssh.conf`, so `ssh -F ssh.conf c01` works as
//! soon as provisioning finishes. Blocks are keyed by alias and upserted:
//! re-running a pipeline rewrites the machine's own block instead of
//! appending a duplicate. Callers serialize concurrent edits with the
//! cluster status ssh-config mutex.

use std::path::Path;

use crate::error::{Error, Result};

/// File name of the generated ssh configuration
pub const SSH_CONFIG_FILE: &str = "ssh.conf";

const HEADER: &str = "# Generated ssh configuration. Do not edit host blocks by hand;\n# they are rewritten on every provisioning run.\n";

/// One `Host` block in the generated configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshConfigEntry {
    /// Short alias, e.g. `c01`
    pub alias: String,
    pub host_name: String,
    pub port: u16,
    pub user: String,
    pub identity_file: String,
    /// Alias of the bastion block this host tunnels through
    pub proxy_alias: Option<String>,
}

impl SshConfigEntry {
    fn render(&self) -> String {
        let mut block = format!(
            "Host {}\n  HostName {}\n  Port {}\n  User {}\n  IdentityFile {}\n  StrictHostKeyChecking no\n  UserKnownHostsFile /dev/null\n",
            self.alias, self.host_name, self.port, self.user, self.identity_file
        );
        if let Some(proxy) = &self.proxy_alias {
            block.push_str(&format!("  ProxyJump {proxy}\n"));
        }
        block
    }
}

/// Insert or replace the entry's `Host` block in `content`
pub fn upsert(content: &str, entry: &SshConfigEntry) -> String {
    let mut out = String::new();
    let mut replaced = false;
    let mut skipping = false;

    for line in content.lines() {
        if let Some(alias) = line.strip_prefix("Host ") {
            if alias.trim() == entry.alias {
                out.push_str(&entry.render());
                replaced = true;
                skipping = true;
                continue;
            }
            skipping = false;
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }

    if out.is_empty() {
        out.push_str(HEADER);
    }
    if !replaced {
        if !out.ends_with("\n\n") {
            out.push('\n');
        }
        out.push_str(&entry.render());
    }
    out
}

/// Upsert the entry into the configuration file at `path`
pub async fn upsert_file(path: &Path, entry: &SshConfigEntry) -> Result<()> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(Error::io("ssh-config", e)),
    };
    let updated = upsert(&content, entry);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io("ssh-config", e))?;
    }
    tokio::fs::write(path, updated)
        .await
        .map_err(|e| Error::io("ssh-config", e))
}
