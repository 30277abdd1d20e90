use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::config::ProxyConfig;

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and environment variables and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::full(path)
        .with_context(|| format!("Failed to expand path: {}", path))?;
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        // Convert relative path to absolute
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 以追加方式打开日志文件，路径先经过展开
pub fn open_log_file(path: &str) -> Result<File> {
    let path = expand_path(path)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {}", path))
}

/// 展开配置中的文件路径
pub fn expand_config_paths(config: &mut ProxyConfig) -> Result<()> {
    if let Some(ref mut ca_bundle) = config.upstream.ca_bundle {
        *ca_bundle = PathBuf::from(expand_path(&ca_bundle.to_string_lossy())?);
    }
    if let Some(ref mut persistence) = config.persistence {
        persistence.path = PathBuf::from(expand_path(&persistence.path.to_string_lossy())?);
    }
    Ok(())
}

/// 加载配置并展开其中的路径
pub fn load_config(config_path: &str) -> Result<ProxyConfig> {
    let mut config = ProxyConfig::load(config_path)?;
    expand_config_paths(&mut config)?;
    Ok(config)
}

fn check_warnings(config: &ProxyConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Some(ref ca_bundle) = config.upstream.ca_bundle {
        if !ca_bundle.exists() {
            warnings.push(format!("CA bundle not found: {:?}", ca_bundle));
        }
    }
    if let Some(ref persistence) = config.persistence {
        let parent_missing = persistence
            .path
            .parent()
            .map(|dir| !dir.as_os_str().is_empty() && !dir.exists())
            .unwrap_or(false);
        if parent_missing {
            warnings.push(format!(
                "Directory for record file does not exist: {:?}",
                persistence.path
            ));
        }
    }
    if config.quota.effective_limit_bytes() == 0 {
        warnings.push("Quota limit is 0 bytes, every request will be rejected".to_string());
    }
    warnings
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    // Check if file exists
    if !path.exists() {
        if format == "json" {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                // Provide hints for common issues
                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. All settings live under the [proxy] table and its subtables");
                println!("  3. bind_port is required");
                println!("  4. relay.bytes_per_second and the timeouts must be greater than 0");
                println!("  5. response_mode must be \"head\" or \"full\"");
            }
            return Err(e);
        }
    };

    let warnings = check_warnings(&config);

    if format == "json" {
        let result = CheckResult {
            valid: true,
            warnings,
            error: None,
            details: serde_json::to_value(&config)?,
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("✓ Listen address: {}", config.listen_addr());
        println!("✓ Backlog: {}", config.backlog);
        println!(
            "✓ Quota: {} bytes per client IP",
            config.quota.effective_limit_bytes()
        );
        println!(
            "✓ Tunnel rate: {} bytes/s per direction ({} ms slices)",
            config.relay.bytes_per_second, config.relay.slice_millis
        );
        println!(
            "✓ Upstream TLS for tunnels: {} (minimum {})",
            config.upstream.tunnel_tls, config.upstream.min_tls_version
        );
        match config.upstream.ca_bundle {
            Some(ref ca_bundle) => println!("✓ CA bundle: {:?}", ca_bundle),
            None => println!("✓ CA bundle: system certificate store"),
        }
        println!("✓ Response mode: {:?}", config.response_mode);
        if let Some(stats_addr) = config.stats_listen_addr() {
            println!("✓ Stats endpoint: http://{}/stats", stats_addr);
        }
        if let Some(ref persistence) = config.persistence {
            println!("✓ Records: {:?}", persistence.path);
        }
        for warning in &warnings {
            println!("⚠ Warning: {}", warning);
        }
        println!("\n✓ Proxy configuration is valid!");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_relative_path() {
        let expanded = expand_path("proxy.toml").unwrap();
        assert!(Path::new(&expanded).is_absolute());
        assert!(expanded.ends_with("proxy.toml"));
    }

    #[test]
    fn test_expand_absolute_path_unchanged() {
        assert_eq!(expand_path("/etc/proxy.toml").unwrap(), "/etc/proxy.toml");
    }

    #[test]
    fn test_open_log_file_expands_variables() {
        let dir = std::env::temp_dir().join(format!("quota-proxy-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::env::set_var("QUOTA_PROXY_TEST_LOG_DIR", &dir);

        open_log_file("$QUOTA_PROXY_TEST_LOG_DIR/proxy.log").unwrap();
        assert!(dir.join("proxy.log").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_expand_config_paths() {
        let mut config = ProxyConfig::builder()
            .bind_port(8080)
            .persistence_path("records.jsonl")
            .build()
            .unwrap();
        expand_config_paths(&mut config).unwrap();

        let path = config.persistence.unwrap().path;
        assert!(path.is_absolute());
        assert!(path.ends_with("records.jsonl"));
    }

    #[test]
    fn test_check_missing_file() {
        assert!(check_config("/nonexistent/proxy.toml", "json").is_err());
    }
}
