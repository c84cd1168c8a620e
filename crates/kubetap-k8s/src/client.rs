//! Kubernetes client for kubetap

use std::path::Path;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Kubernetes client wrapper
pub struct KubeClient {
    kubeconfig: Kubeconfig,
    current_context: Option<String>,
}

impl KubeClient {
    /// Load the kubeconfig from `path`, or from the default locations
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let kubeconfig = match path {
            Some(path) => Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig at {}", path.display()))?,
            None => {
                Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?
            }
        };

        Ok(Self::from_kubeconfig(kubeconfig))
    }

    pub fn from_kubeconfig(kubeconfig: Kubeconfig) -> Self {
        let current_context = kubeconfig.current_context.clone();
        Self {
            kubeconfig,
            current_context,
        }
    }

    /// Names of all contexts in the kubeconfig
    pub fn context_names(&self) -> Vec<&str> {
        self.kubeconfig
            .contexts
            .iter()
            .map(|ctx| ctx.name.as_str())
            .collect()
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Namespace configured on a context, if any
    pub fn context_namespace(&self, context_name: &str) -> Option<String> {
        self.kubeconfig
            .contexts
            .iter()
            .find(|ctx| ctx.name == context_name)
            .and_then(|ctx| ctx.context.as_ref())
            .and_then(|ctx| ctx.namespace.clone())
    }

    /// Create a kube::Client for a context, falling back to the current one
    pub async fn client(&self, context_name: Option<&str>) -> Result<kube::Client> {
        let context = context_name
            .or(self.current_context())
            .map(str::to_string);

        if let Some(name) = &context {
            if !self.context_names().contains(&name.as_str()) {
                anyhow::bail!("Context '{}' not found in kubeconfig", name);
            }
        }

        let config = kube::Config::from_custom_kubeconfig(
            self.kubeconfig.clone(),
            &KubeConfigOptions {
                context: context.clone(),
                ..Default::default()
            },
        )
        .await
        .with_context(|| {
            format!(
                "Failed to create config for context: {}",
                context.as_deref().unwrap_or("<default>")
            )
        })?;

        let client = kube::Client::try_from(config).with_context(|| {
            format!(
                "Failed to create client for context: {}",
                context.as_deref().unwrap_or("<default>")
            )
        })?;

        tracing::info!(
            context = context.as_deref().unwrap_or("<default>"),
            "Connected to cluster"
        );

        Ok(client)
    }
}
