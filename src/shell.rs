//! Remote command execution
//!
//! All post-boot machine configuration happens by running shell commands
//! over SSH. The [`ShellClient`] trait is the seam the actuators and NAT
//! provisioners depend on; [`OpenSshClient`] is the production
//! implementation, shelling out to the system `ssh` binary with a
//! `ProxyJump` hop when the endpoint carries one. Tests substitute a mock
//! or a scripted fake.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{SshCredential, SshEndpoint};
use crate::error::{Error, Result};
use crate::retry::{poll_until, Poll};

#[cfg(test)]
use mockall::automock;

/// Executes commands on a remote machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ShellClient: Send + Sync {
    /// Run `command` on the target, returning its stdout
    async fn run(
        &self,
        credential: &SshCredential,
        endpoint: &SshEndpoint,
        command: &str,
    ) -> Result<String>;

    /// Run `command` on the target with `stdin` piped to it
    async fn run_with_stdin(
        &self,
        credential: &SshCredential,
        endpoint: &SshEndpoint,
        command: &str,
        stdin: &[u8],
    ) -> Result<String>;
}

/// Whether a regular file exists on the target
pub async fn file_exists(
    shell: &dyn ShellClient,
    credential: &SshCredential,
    endpoint: &SshEndpoint,
    path: &str,
) -> Result<bool> {
    let out = shell
        .run(
            credential,
            endpoint,
            &format!("if [ -f {path} ]; then echo found; fi"),
        )
        .await?;
    Ok(out.trim() == "found")
}

/// Create a directory (and its parents) on the target
pub async fn mkdir_all(
    shell: &dyn ShellClient,
    credential: &SshCredential,
    endpoint: &SshEndpoint,
    path: &str,
) -> Result<()> {
    shell
        .run(credential, endpoint, &format!("sudo mkdir -p {path}"))
        .await?;
    Ok(())
}

/// Write `content` to a file on the target, creating parent directories
pub async fn write_file(
    shell: &dyn ShellClient,
    credential: &SshCredential,
    endpoint: &SshEndpoint,
    path: &str,
    mode: &str,
    content: &[u8],
) -> Result<()> {
    let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or(".");
    let command = format!("sudo mkdir -p {dir} && sudo tee {path} >/dev/null && sudo chmod {mode} {path}");
    shell
        .run_with_stdin(credential, endpoint, &command, content)
        .await?;
    Ok(())
}

/// Poll the target until an SSH session can be established.
///
/// Connection failures are treated as "not yet"; only cancellation or
/// permanent errors abort the wait.
pub async fn wait_online(
    shell: &dyn ShellClient,
    credential: &SshCredential,
    endpoint: &SshEndpoint,
    cancel: &CancellationToken,
) -> Result<()> {
    poll_until(Duration::from_secs(5), cancel, move || async move {
        match shell.run(credential, endpoint, "echo ok").await {
            Ok(_) => Ok(Poll::Ready(())),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                trace!(target = %endpoint.endpoint, error = %e, "machine not reachable yet");
                Ok(Poll::Pending)
            }
        }
    })
    .await
}

/// Production shell client backed by the system `ssh` binary
#[derive(Debug, Default)]
pub struct OpenSshClient;

impl OpenSshClient {
    pub fn new() -> Self {
        Self
    }

    fn ssh_args(credential: &SshCredential, endpoint: &SshEndpoint) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-i".to_string(),
            credential.private_key_path.clone(),
            "-p".to_string(),
            endpoint.endpoint.port.to_string(),
        ];
        if let Some(proxy) = &endpoint.proxy {
            args.push("-o".to_string());
            args.push(format!(
                "ProxyJump={}@{}:{}",
                credential.username, proxy.endpoint.addr, proxy.endpoint.port
            ));
        }
        args.push(format!("{}@{}", credential.username, endpoint.endpoint.addr));
        args
    }

    async fn exec(
        credential: &SshCredential,
        endpoint: &SshEndpoint,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<String> {
        let args = Self::ssh_args(credential, endpoint);
        debug!(target = %endpoint.endpoint, command = %command, "running remote command");

        let mut child = Command::new("ssh")
            .args(&args)
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io("ssh-spawn", e))?;

        if let Some(input) = stdin {
            let mut handle = child.stdin.take().ok_or_else(|| {
                Error::io(
                    "ssh-stdin",
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin not captured"),
                )
            })?;
            handle
                .write_all(input)
                .await
                .map_err(|e| Error::io("ssh-stdin", e))?;
            drop(handle);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::io("ssh-wait", e))?;

        if !output.status.success() {
            return Err(Error::remote_command(
                command,
                endpoint.endpoint.to_string(),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ShellClient for OpenSshClient {
    async fn run(
        &self,
        credential: &SshCredential,
        endpoint: &SshEndpoint,
        command: &str,
    ) -> Result<String> {
        Self::exec(credential, endpoint, command, None).await
    }

    async fn run_with_stdin(
        &self,
        credential: &SshCredential,
        endpoint: &SshEndpoint,
        command: &str,
        stdin: &[u8],
    ) -> Result<String> {
        Self::exec(credential, endpoint, command, Some(stdin)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> SshCredential {
        SshCredential {
            username: "sk8".to_string(),
            private_key_path: "/tmp/id_rsa".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_proxy_hop_becomes_proxy_jump() {
        let bastion = SshEndpoint::direct("203.0.113.7", 2022);
        let endpoint = SshEndpoint::proxied("10.0.0.5", 22, bastion);
        let args = OpenSshClient::ssh_args(&cred(), &endpoint);
        let joined = args.join(" ");
        assert!(joined.contains("ProxyJump=sk8@203.0.113.7:2022"));
        assert!(joined.ends_with("sk8@10.0.0.5"));
    }

    #[test]
    fn test_direct_endpoint_has_no_proxy_jump() {
        let endpoint = SshEndpoint::direct("10.0.0.5", 22);
        let args = OpenSshClient::ssh_args(&cred(), &endpoint);
        assert!(!args.join(" ").contains("ProxyJump"));
    }

    #[tokio::test]
    async fn test_file_exists_parses_probe_output() {
        let mut shell = MockShellClient::new();
        shell
            .expect_run()
            .withf(|_, _, cmd| cmd.contains("[ -f /etc/kubernetes/admin.conf ]"))
            .returning(|_, _, _| Ok("found\n".to_string()));
        let endpoint = SshEndpoint::direct("10.0.0.5", 22);
        assert!(
            file_exists(&shell, &cred(), &endpoint, "/etc/kubernetes/admin.conf")
                .await
                .unwrap()
        );
    }
}
