use clap::Parser;

/// Runtime configuration shared by every reconciler. Read-only after
/// startup; carried in each controller Context.
#[derive(Parser, Clone, Debug)]
#[command(version, about = "NetBird Kubernetes operator", long_about = None)]
pub struct Settings {
    /// Management service URL
    #[arg(long, env = "NB_MANAGEMENT_URL", default_value = "https://api.netbird.io")]
    pub management_url: String,

    /// Image for the netbird client container
    #[arg(long, default_value = "netbirdio/netbird:latest")]
    pub client_image: String,

    /// User-friendly cluster name used when naming remote objects
    #[arg(long, default_value = "kubernetes")]
    pub cluster_name: String,

    /// Cluster DNS zone used for projected service addresses
    #[arg(long, default_value = "svc.cluster.local")]
    pub cluster_dns: String,

    /// Create one NetBird network per namespace instead of one per cluster
    #[arg(long, default_value_t = false)]
    pub namespaced_networks: bool,

    /// Token for management API operations
    #[arg(long, env = "NB_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Namespace this controller (and the default routing peer) lives in
    #[arg(long, env = "POD_NAMESPACE", default_value = "netbird")]
    pub controller_namespace: String,

    /// Synthesize NBPolicy objects for unknown logical policy names
    #[arg(long, default_value_t = true)]
    pub allow_auto_policies: bool,

    /// Bind address for the health and diagnostics endpoint
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub probe_bind: String,
}

impl Settings {
    /// Remote network name for a routing peer in `namespace`.
    pub fn network_name(&self, namespace: &str) -> String {
        if self.namespaced_networks {
            format!("{}-{}", self.cluster_name, namespace)
        } else {
            self.cluster_name.clone()
        }
    }

    /// Namespace holding the routing peer a Service in `namespace` binds to.
    pub fn router_namespace<'a>(&'a self, namespace: &'a str) -> &'a str {
        if self.namespaced_networks {
            namespace
        } else {
            &self.controller_namespace
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            management_url: "https://api.netbird.io".into(),
            client_image: "netbirdio/netbird:latest".into(),
            cluster_name: "kubernetes".into(),
            cluster_dns: "svc.cluster.local".into(),
            namespaced_networks: false,
            api_key: String::new(),
            controller_namespace: "netbird".into(),
            allow_auto_policies: true,
            probe_bind: "0.0.0.0:8080".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_name_follows_namespacing_mode() {
        let mut settings = Settings::default();
        assert_eq!(settings.network_name("default"), "kubernetes");
        settings.namespaced_networks = true;
        assert_eq!(settings.network_name("default"), "kubernetes-default");
    }

    #[test]
    fn router_namespace_follows_namespacing_mode() {
        let mut settings = Settings::default();
        assert_eq!(settings.router_namespace("default"), "netbird");
        settings.namespaced_networks = true;
        assert_eq!(settings.router_namespace("default"), "default");
    }
}
