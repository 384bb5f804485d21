//! Config command handlers

use anyhow::{bail, Context, Result};

use zonesync_core::Config;

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, sync_url, sync_enabled, sync_group, sync_interval_secs, \
                    busy_timeout_ms, lock_retry_base_ms, http_retry_base_ms";

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to encode configuration")?
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let unset = || "(not set)".to_string();
            println!("Configuration:");
            println!("  data_dir:           {}", config.data_dir.display());
            println!(
                "  sync_url:           {}",
                config.sync_url.clone().unwrap_or_else(unset)
            );
            println!("  sync_enabled:       {}", config.sync_enabled);
            println!(
                "  sync_group:         {}",
                config.sync_group.clone().unwrap_or_else(unset)
            );
            println!("  sync_interval_secs: {}", config.sync_interval_secs);
            println!("  busy_timeout_ms:    {}", config.busy_timeout_ms);
            println!("  lock_retry_base_ms: {}", config.lock_retry_base_ms);
            println!("  http_retry_base_ms: {}", config.http_retry_base_ms);
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    apply(&mut config, &key, &value)?;
    config.save().context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let optional = |value: &str| {
        if value.is_empty() || value == "none" {
            None
        } else {
            Some(value.to_string())
        }
    };

    match key {
        "data_dir" => config.data_dir = value.into(),
        "sync_url" => config.sync_url = optional(value),
        "sync_group" => config.sync_group = optional(value),
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "sync_interval_secs" => config.sync_interval_secs = parse_number(key, value)?,
        "busy_timeout_ms" => config.busy_timeout_ms = parse_number(key, value)?,
        "lock_retry_base_ms" => config.lock_retry_base_ms = parse_number(key, value)?,
        "http_retry_base_ms" => config.http_retry_base_ms = parse_number(key, value)?,
        _ => bail!("Unknown configuration key: '{}'\nValid keys: {}", key, KEYS),
    }
    Ok(())
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("Invalid value for {}. Expected a whole number.", key))
}
