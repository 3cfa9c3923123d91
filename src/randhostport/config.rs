use anyhow::{bail, Context, Result};
use std::{ops::RangeInclusive, path::Path};

/// Configures the random hostport injector.
///
/// Loaded once, from JSON, before the injector starts.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// The first allocable host port.
    pub start_port: u16,

    /// The last allocable host port (inclusive).
    pub end_port: u16,

    /// Hands out ports sequentially instead of tracking per-port usage
    /// through a pod informer.
    #[serde(default)]
    pub enable_order_assign: bool,

    /// A kubeconfig file to build the plugin's Kubernetes client from. When
    /// empty, the server's own client is used.
    #[serde(default)]
    pub kubeconfig: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read randhostport config {}", path.display()))?;
        Self::from_slice(&bytes)
            .with_context(|| format!("invalid randhostport config {}", path.display()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let config = serde_json::from_slice::<Self>(bytes)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.start_port == 0 {
            bail!("startPort must be greater than 0");
        }
        if self.start_port > self.end_port {
            bail!(
                "startPort {} must not be greater than endPort {}",
                self.start_port,
                self.end_port
            );
        }
        Ok(())
    }

    /// The allocable host ports.
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start_port..=self.end_port
    }

    pub fn kubeconfig(&self) -> Option<&Path> {
        let path = self.kubeconfig.trim();
        if path.is_empty() {
            return None;
        }
        Some(Path::new(path))
    }

    /// Builds the Kubernetes client the injector watches pods with.
    pub async fn client(&self, default: kube::Client) -> Result<kube::Client> {
        let path = match self.kubeconfig() {
            Some(path) => path,
            None => return Ok(default),
        };

        tracing::info!(kubeconfig = %path.display(), "building client from kubeconfig");
        let kubeconfig = kube::config::Kubeconfig::read_from(path)
            .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &kube::config::KubeConfigOptions::default(),
        )
        .await
        .with_context(|| format!("invalid kubeconfig {}", path.display()))?;
        kube::Client::try_from(config).context("failed to build Kubernetes client")
    }
}
