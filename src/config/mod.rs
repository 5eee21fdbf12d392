pub mod types;


pub use types::*;

use crate::balancer::strategy::Strategy;
use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used — allowing the gateway to start with
    /// zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        // Environment variable overrides for infrastructure settings.
        config.apply_env_overrides();

        config.validate()?;
        let total_instances: usize = config.services.iter().map(|s| s.instances.len()).sum();
        tracing::info!(
            services = config.services.len(),
            total_instances = total_instances,
            "loaded gateway configuration"
        );
        Ok(config)
    }

    /// Apply environment variable overrides for listen addresses. Business
    /// config (services, instances, policies) should be managed via the
    /// config file or the management API — not environment variables.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAY_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("RELAY_ADMIN_LISTEN") {
            self.admin_listen = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();

        for service in &self.services {
            if service.name.is_empty() {
                anyhow::bail!("service with empty name");
            }
            if !seen.insert(service.name.as_str()) {
                anyhow::bail!("duplicate service name '{}'", service.name);
            }
            if Strategy::parse(&service.strategy).is_none() {
                anyhow::bail!(
                    "service '{}' has unknown strategy '{}'",
                    service.name,
                    service.strategy
                );
            }
            if service.timeout_secs <= 0.0 {
                anyhow::bail!("service '{}' has non-positive timeout", service.name);
            }
            if let Some(ref prefix) = service.route_prefix {
                if !prefix.starts_with('/') {
                    anyhow::bail!(
                        "service '{}' route_prefix '{}' must start with '/'",
                        service.name,
                        prefix
                    );
                }
            }
            if service.circuit_breaker.failure_threshold == 0 {
                anyhow::bail!(
                    "service '{}' circuit_breaker.failure_threshold must be >= 1",
                    service.name
                );
            }
            for inst in &service.instances {
                if inst.url.is_empty() {
                    anyhow::bail!("service '{}' has an instance with empty url", service.name);
                }
                if !inst.url.starts_with("http://") && !inst.url.starts_with("https://") {
                    anyhow::bail!(
                        "service '{}' instance url '{}' must be http(s)",
                        service.name,
                        inst.url
                    );
                }
                if inst.weight <= 0.0 {
                    anyhow::bail!(
                        "service '{}' instance '{}' has non-positive weight",
                        service.name,
                        inst.url
                    );
                }
            }
        }
        Ok(())
    }

    /// Total configured instance count across all services.
    pub fn total_instance_count(&self) -> usize {
        self.services.iter().map(|s| s.instances.len()).sum()
    }
}
