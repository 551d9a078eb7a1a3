//! kubeadm configuration and output handling
//!
//! Renders the kubeadm configuration document for `kubeadm init`, gating
//! the config-API version on the Kubernetes version being deployed, and
//! parses the two artifacts the bootstrap produces: the `kubeadm join`
//! command printed in the init log and the generated `admin.conf`
//! kubeconfig, whose server address is rewritten to the cluster's
//! published endpoint.

use std::sync::OnceLock;

use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use semver::Version;
use serde::Serialize;

use crate::error::{Error, Result};

const CONFIG_TEMPLATE: &str = r#"apiVersion: {{ api_version }}
kind: ClusterConfiguration
clusterName: {{ cluster_name }}
kubernetesVersion: v{{ kubernetes_version }}
controlPlaneEndpoint: {{ control_plane_endpoint }}
{%- if pod_network_cidr %}
networking:
  podSubnet: {{ pod_network_cidr }}
{%- endif %}
{%- if cert_sans or cloud_provider %}
apiServer:
{%- if cert_sans %}
  certSANs:
{%- for san in cert_sans %}
    - {{ san }}
{%- endfor %}
{%- endif %}
{%- if cloud_provider %}
  extraArgs:
    cloud-provider: {{ cloud_provider }}
{%- endif %}
{%- endif %}
{%- if cloud_provider %}
controllerManager:
  extraArgs:
    cloud-provider: {{ cloud_provider }}
{%- endif %}
---
apiVersion: {{ api_version }}
kind: InitConfiguration
nodeRegistration:
  name: {{ node_name }}
{%- if cloud_provider %}
  kubeletExtraArgs:
    cloud-provider: {{ cloud_provider }}
{%- endif %}
"#;

/// Context for rendering the kubeadm configuration document
#[derive(Clone, Debug, Serialize)]
pub struct ConfigData {
    pub cluster_name: String,
    /// Bare semver, without the leading `v`
    pub kubernetes_version: String,
    /// `<addr>:<port>` the API server binds and advertises on, normally
    /// the machine's own internal address
    pub control_plane_endpoint: String,
    pub node_name: String,
    /// Extra subject alternative names for the API server certificate,
    /// e.g. the cluster's published endpoint address
    pub cert_sans: Vec<String>,
    pub pod_network_cidr: Option<String>,
    pub cloud_provider: Option<String>,
}

/// The kubeadm config API version appropriate for a Kubernetes version
pub fn api_version_for(kubernetes_version: &str) -> Result<&'static str> {
    let version = Version::parse(kubernetes_version.trim_start_matches('v')).map_err(|e| {
        Error::validation(format!(
            "invalid kubernetes version {kubernetes_version:?}: {e}"
        ))
    })?;
    Ok(if version >= Version::new(1, 15, 0) {
        "kubeadm.k8s.io/v1beta2"
    } else if version >= Version::new(1, 13, 0) {
        "kubeadm.k8s.io/v1beta1"
    } else {
        "kubeadm.k8s.io/v1alpha3"
    })
}

fn template_env() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(|| {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template("kubeadm-config", CONFIG_TEMPLATE)
            .expect("kubeadm config template parses");
        env
    })
}

/// Render the kubeadm configuration document for `kubeadm init`
pub fn render_config(data: &ConfigData) -> Result<String> {
    let api_version = api_version_for(&data.kubernetes_version)?;
    let template = template_env()
        .get_template("kubeadm-config")
        .map_err(|e| Error::serialization_for_kind("kubeadm-config", e.to_string()))?;
    template
        .render(minijinja::context! {
            api_version,
            cluster_name => data.cluster_name,
            kubernetes_version => data.kubernetes_version,
            control_plane_endpoint => data.control_plane_endpoint,
            node_name => data.node_name,
            cert_sans => data.cert_sans,
            pod_network_cidr => data.pod_network_cidr,
            cloud_provider => data.cloud_provider,
        })
        .map_err(|e| Error::serialization_for_kind("kubeadm-config", e.to_string()))
}

/// Extract the `kubeadm join` command from `kubeadm init` output.
///
/// Backslash line continuations are folded and whitespace collapsed, so the
/// result is a single runnable command line.
pub fn extract_join_command(init_output: &str) -> Result<String> {
    let mut lines = init_output.lines();
    for line in lines.by_ref() {
        let trimmed = line.trim();
        if !trimmed.starts_with("kubeadm join") {
            continue;
        }
        let mut parts: Vec<&str> = Vec::new();
        let mut current = trimmed;
        loop {
            let continued = current.ends_with('\\');
            parts.extend(current.trim_end_matches('\\').split_whitespace());
            if !continued {
                break;
            }
            match lines.next() {
                Some(next) => current = next.trim(),
                None => break,
            }
        }
        return Ok(parts.join(" "));
    }
    Err(Error::not_found("kubeadm join command in init output"))
}

/// Rewrite the `server:` address of a kubeconfig to the published endpoint
pub fn rewrite_kubeconfig_server(kubeconfig: &str, endpoint: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^(\s*server:\s*https://)[^\s]+").expect("valid server pattern")
    });
    pattern
        .replace_all(kubeconfig, format!("${{1}}{endpoint}"))
        .into_owned()
}
