//! Shared test doubles
//!
//! [`FakeShell`] stands in for every remote host a test touches: cluster
//! machines (tracked as per-host file sets plus canned kubeadm behavior)
//! and the IPVS bastion (tracked as service and target tables with the
//! same check-then-create semantics the real flock scripts have). Hosts
//! are keyed by `addr:port`; when an IPVS forward is established the
//! forwarded endpoint becomes an alias for the target machine, exactly as
//! the real forwarding would behave.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use crate::config::{SshCredential, SshEndpoint};
use crate::error::Result;
use crate::shell::ShellClient;

#[derive(Default)]
pub(crate) struct FakeShell {
    /// Per-host sets of existing file paths
    files: Mutex<HashMap<String, HashSet<String>>>,
    /// Forwarded endpoint -> real host
    aliases: Mutex<HashMap<String, String>>,
    /// IPVS service id -> listen port
    services: Mutex<HashMap<String, u16>>,
    /// IPVS ssh service id -> single target
    ssh_targets: Mutex<HashMap<String, String>>,
    service_creates: AtomicU32,
    network_applies: AtomicU32,
    inits: AtomicU32,
    token_creates: AtomicU32,
    joins: Mutex<Vec<String>>,
}

fn capture(pattern: &'static OnceLock<Regex>, re: &str, text: &str) -> Option<String> {
    let pattern = pattern.get_or_init(|| Regex::new(re).unwrap());
    pattern.captures(text).map(|c| c[1].to_string())
}

impl FakeShell {
    pub fn seed_file(&self, host: &str, path: &str) {
        self.files
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .insert(path.to_string());
    }

    pub fn init_count(&self) -> u32 {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn token_create_count(&self) -> u32 {
        self.token_creates.load(Ordering::SeqCst)
    }

    pub fn join_count(&self) -> usize {
        self.joins.lock().unwrap().len()
    }

    pub fn joined_hosts(&self) -> Vec<String> {
        self.joins.lock().unwrap().clone()
    }

    pub fn service_create_count(&self) -> u32 {
        self.service_creates.load(Ordering::SeqCst)
    }

    pub fn network_apply_count(&self) -> u32 {
        self.network_applies.load(Ordering::SeqCst)
    }

    fn host_of(&self, endpoint: &SshEndpoint) -> String {
        let key = format!("{}:{}", endpoint.endpoint.addr, endpoint.endpoint.port);
        self.aliases.lock().unwrap().get(&key).cloned().unwrap_or(key)
    }

    pub fn has_file(&self, host: &str, path: &str) -> bool {
        self.files
            .lock()
            .unwrap()
            .get(host)
            .is_some_and(|f| f.contains(path))
    }

    fn bastion_script(&self, command: &str) -> Result<String> {
        static SID: OnceLock<Regex> = OnceLock::new();
        static VIP: OnceLock<Regex> = OnceLock::new();
        static TARGET: OnceLock<Regex> = OnceLock::new();

        let sid = capture(&SID, r"/var/run/kubelift/([A-Za-z0-9._-]+)\.lvs", command)
            .expect("bastion command names a service");

        if command.contains("ipvsadm -A") {
            let mut services = self.services.lock().unwrap();
            let next = 30000 + services.len() as u16;
            let port = *services.entry(sid).or_insert_with(|| {
                self.service_creates.fetch_add(1, Ordering::SeqCst);
                next
            });
            Ok(format!("{port}\n"))
        } else if command.contains("grep Masq") {
            let vip = capture(&VIP, r"-t ([0-9.]+):\$_p", command)
                .expect("bastion command names a vip");
            let target = capture(&TARGET, r"-r ([0-9.]+:[0-9]+) -m", command)
                .expect("bastion command names a target");
            let port = *self.services.lock().unwrap().get(&sid).expect("service exists");
            let winner = {
                let mut targets = self.ssh_targets.lock().unwrap();
                targets.entry(sid).or_insert(target).clone()
            };
            // The forwarded public endpoint now reaches the winner.
            self.aliases
                .lock()
                .unwrap()
                .insert(format!("{vip}:{port}"), winner.clone());
            Ok(format!("{winner}\n"))
        } else if command.contains("ipvsadm -a") {
            Ok(String::new())
        } else if command.contains("ipvsadm -D") {
            self.services.lock().unwrap().remove(&sid);
            self.ssh_targets.lock().unwrap().remove(&sid);
            Ok(String::new())
        } else {
            panic!("unexpected bastion command: {command}");
        }
    }
}

const INIT_OUTPUT: &str = "\
Your Kubernetes control-plane has initialized successfully!

You can now join any number of machines by running the following on each node as root:

  kubeadm join 10.0.0.5:443 --token abcdef.0123456789abcdef \\
    --discovery-token-ca-cert-hash sha256:cafebeef
";

const ADMIN_KUBECONFIG: &str = "\
apiVersion: v1
clusters:
- cluster:
    server: https://10.0.0.5:6443
  name: kubernetes
";

#[async_trait]
impl ShellClient for FakeShell {
    async fn run(
        &self,
        _credential: &SshCredential,
        endpoint: &SshEndpoint,
        command: &str,
    ) -> Result<String> {
        if command.contains("/var/run/kubelift/") {
            return self.bastion_script(command);
        }

        let host = self.host_of(endpoint);
        if command == "echo ok" {
            Ok("ok\n".to_string())
        } else if let Some(path) = {
            static PROBE: OnceLock<Regex> = OnceLock::new();
            capture(&PROBE, r"if \[ -f ([^ ]+) \]", command)
        } {
            if self.has_file(&host, &path) {
                Ok("found\n".to_string())
            } else {
                Ok(String::new())
            }
        } else if command.starts_with("sudo mkdir -p") || command.starts_with("sudo chown") {
            Ok(String::new())
        } else if command.contains("[ -e /etc/kubernetes/kubelet.conf ]") {
            if !self.has_file(&host, "/etc/kubernetes/kubelet.conf") {
                self.joins.lock().unwrap().push(host.clone());
                self.seed_file(&host, "/etc/kubernetes/kubelet.conf");
            }
            Ok(String::new())
        } else if command.contains("kubeadm init") {
            self.inits.fetch_add(1, Ordering::SeqCst);
            self.seed_file(&host, "/etc/kubernetes/admin.conf");
            self.seed_file(&host, "/etc/kubernetes/kubelet.conf");
            Ok(INIT_OUTPUT.to_string())
        } else if command.contains("kubeadm token create") {
            self.token_creates.fetch_add(1, Ordering::SeqCst);
            Ok(
                "kubeadm join 10.0.0.5:443 --token fresh.token0123456789 \
                 --discovery-token-ca-cert-hash sha256:cafebeef\n"
                    .to_string(),
            )
        } else if command.contains("cat /etc/kubernetes/admin.conf") {
            Ok(ADMIN_KUBECONFIG.to_string())
        } else {
            panic!("unexpected machine command on {host}: {command}");
        }
    }

    async fn run_with_stdin(
        &self,
        _credential: &SshCredential,
        endpoint: &SshEndpoint,
        command: &str,
        _stdin: &[u8],
    ) -> Result<String> {
        static TEE: OnceLock<Regex> = OnceLock::new();
        let host = self.host_of(endpoint);
        if command.contains("kubectl") && command.contains("apply -f -") {
            self.network_applies.fetch_add(1, Ordering::SeqCst);
            return Ok(String::new());
        }
        let path = capture(&TEE, r"sudo tee ([^ ]+) ", command)
            .unwrap_or_else(|| panic!("unexpected upload command on {host}: {command}"));
        self.seed_file(&host, &path);
        Ok(String::new())
    }
}
