//! Conversion from command-line arguments to library configuration
//!
//! Environment variables (`NOBG_*`) form the base layer; explicit flags
//! override them.

use crate::cli::main_impl::{ModelArgs, ServeArgs};
use crate::config::{ModelConfig, ServerConfig};
use anyhow::{Context, Result};
use std::time::Duration;

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Model settings from the environment plus `args`
    pub(crate) fn model_config(args: &ModelArgs) -> Result<ModelConfig> {
        let mut config = ModelConfig::from_env().context("Invalid NOBG_* model settings")?;

        if let Some(model) = &args.model {
            config.model_id.clone_from(model);
        }
        if let Some(dir) = &args.model_dir {
            config.bundled_dir = Some(dir.clone());
        }
        if let Some(dir) = &args.cache_dir {
            config.cache_dir = Some(dir.clone());
        }
        if let Some(backend) = &args.backend {
            config.backend = backend.parse()?;
        }
        if let Some(provider) = &args.execution_provider {
            config.execution_provider = provider.parse()?;
        }
        if let Some(variant) = &args.variant {
            config.variant.clone_from(variant);
        }
        if let Some(threads) = args.threads {
            config.intra_threads = threads;
            config.inter_threads = threads;
        }
        if let Some(pool_size) = args.pool_size {
            config.pool_size = pool_size;
        }

        config.validate()?;
        Ok(config)
    }

    /// Server settings from the environment plus `args`
    pub(crate) fn server_config(args: &ServeArgs) -> Result<ServerConfig> {
        let mut config = ServerConfig::from_env().context("Invalid NOBG_* server settings")?;

        if let Some(host) = &args.host {
            config.host.clone_from(host);
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(mb) = args.max_upload_mb {
            config.max_upload_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(secs) = args.timeout_secs {
            config.inference_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(name) = &args.project_name {
            config.project_name.clone_from(name);
        }

        config.validate()?;
        Ok(config)
    }
}
