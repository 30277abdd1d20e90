use anyhow::{Context, Result};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;
use tracing::{debug, warn};

/// 上游 TLS 最低协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MinTlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl MinTlsVersion {
    fn protocol_versions(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        static TLS12_AND_UP: &[&rustls::SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

        match self {
            MinTlsVersion::Tls12 => TLS12_AND_UP,
            MinTlsVersion::Tls13 => TLS13_ONLY,
        }
    }
}

impl std::fmt::Display for MinTlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MinTlsVersion::Tls12 => write!(f, "TLS 1.2"),
            MinTlsVersion::Tls13 => write!(f, "TLS 1.3"),
        }
    }
}

/// 加载受信任的根证书
///
/// 指定了 CA 证书包时只信任该文件中的证书，否则使用系统证书库
pub fn load_root_store(ca_bundle: Option<&Path>) -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore::empty();

    if let Some(ca_path) = ca_bundle {
        let ca_file = File::open(ca_path)
            .with_context(|| format!("Failed to open CA bundle: {:?}", ca_path))?;
        let mut ca_reader = BufReader::new(ca_file);
        let ca_certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut ca_reader)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse CA certificates")?;

        for cert in ca_certs {
            root_store
                .add(cert)
                .context("Failed to add CA certificate")?;
        }
        debug!("Loaded {} trusted roots from {:?}", root_store.len(), ca_path);
    } else {
        let native_certs = rustls_native_certs::load_native_certs();
        for err in &native_certs.errors {
            warn!("Error while loading system certificates: {}", err);
        }
        let (added, ignored) = root_store.add_parsable_certificates(native_certs.certs);
        debug!(
            "Loaded {} trusted roots from the system store ({} ignored)",
            added, ignored
        );
    }

    if root_store.is_empty() {
        warn!("Trusted root store is empty, upstream TLS verification will always fail");
    }

    Ok(root_store)
}

/// 构建用于连接上游的 TLS 客户端配置
pub fn load_upstream_client_config(
    ca_bundle: Option<&Path>,
    min_version: MinTlsVersion,
) -> Result<Arc<rustls::ClientConfig>> {
    let root_store = load_root_store(ca_bundle)?;

    let config = rustls::ClientConfig::builder_with_protocol_versions(min_version.protocol_versions())
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}
