//! Well-known label keys carried on cluster and machine records
//!
//! Labels are opaque string metadata; these constants are the keys the
//! actuators and orchestrators agree on.

/// Path to the cluster's local configuration directory
pub const CONFIG_DIR: &str = "kubelift.io/config-dir";

/// Kind of cloud provider integration configured for the cluster
pub const CLOUD_PROVIDER: &str = "kubelift.io/cloud-provider";

/// Kubernetes build id used to resolve the deployed artifacts
pub const KUBERNETES_BUILD_ID: &str = "kubelift.io/kubernetes-build-id";

/// Download URL for the resolved Kubernetes build
pub const KUBERNETES_BUILD_URL: &str = "kubelift.io/kubernetes-build-url";

/// Pod network CIDR; when set, the pod-network manifest apply is skipped
pub const POD_NETWORK_CIDR: &str = "kubelift.io/pod-network-cidr";

/// Provider group whose actuators reconcile this cluster
pub const PROVIDER_GROUP: &str = "kubelift.io/provider-group";
