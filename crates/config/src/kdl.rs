//! KDL configuration parsing.

use std::path::PathBuf;

use ::kdl::{KdlDocument, KdlNode, KdlValue};
use anyhow::{anyhow, Result};
use tracing::trace;

use crate::{
    Config, ConfigError, DomainConfig, RenewalConfig, SelfSignedConfig, StorageBackend,
    StorageConfig,
};

/// Parse a KDL document into a [`Config`] (not yet validated)
pub(crate) fn parse_document(content: &str) -> Result<Config, ConfigError> {
    let doc: KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
        let report = miette::Report::new(e);
        ConfigError::Parse(format!("{report:?}"))
    })?;

    parse_config(&doc).map_err(|e| ConfigError::Parse(format!("{e:#}")))
}

fn parse_config(doc: &KdlDocument) -> Result<Config> {
    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "storage" => config.storage = parse_storage(node)?,
            "renewal" => config.renewal = parse_renewal(node)?,
            "self-signed" => config.self_signed = parse_self_signed(node)?,
            "domains" => config.domains = parse_domains(node)?,
            other => {
                return Err(anyhow!(
                    "Unknown top-level block '{}'. Valid blocks: storage, renewal, self-signed, domains",
                    other
                ));
            }
        }
    }

    Ok(config)
}

/// Parse storage configuration block
fn parse_storage(node: &KdlNode) -> Result<StorageConfig> {
    trace!("Parsing storage configuration block");
    let defaults = StorageConfig::default();

    let backend = match get_string_entry(node, "backend")? {
        Some(name) => StorageBackend::from_name(&name).ok_or_else(|| {
            anyhow!(
                "Invalid storage backend '{}'. Valid backends: directory, memory, redis",
                name
            )
        })?,
        None => defaults.backend,
    };

    let path = match get_string_entry(node, "path")? {
        Some(path) => Some(PathBuf::from(path)),
        // A non-directory backend has no use for the default path
        None if backend == StorageBackend::Directory => defaults.path,
        None => None,
    };

    Ok(StorageConfig {
        backend,
        path,
        url: get_string_entry(node, "url")?,
        prefix: get_string_entry(node, "prefix")?.unwrap_or(defaults.prefix),
    })
}

/// Parse renewal configuration block
fn parse_renewal(node: &KdlNode) -> Result<RenewalConfig> {
    trace!("Parsing renewal configuration block");
    let defaults = RenewalConfig::default();

    let config = RenewalConfig {
        renew_before_days: get_u64_entry(node, "renew-before-days")?
            .map(u32::try_from)
            .transpose()?
            .unwrap_or(defaults.renew_before_days),
        jitter_secs: get_u64_entry(node, "jitter-secs")?.unwrap_or(defaults.jitter_secs),
        attempt_timeout_secs: get_u64_entry(node, "attempt-timeout-secs")?
            .unwrap_or(defaults.attempt_timeout_secs),
        ocsp_window_hours: get_u64_entry(node, "ocsp-window-hours")?
            .unwrap_or(defaults.ocsp_window_hours),
        ocsp_timeout_secs: get_u64_entry(node, "ocsp-timeout-secs")?
            .unwrap_or(defaults.ocsp_timeout_secs),
    };

    trace!(
        renew_before_days = config.renew_before_days,
        jitter_secs = config.jitter_secs,
        "Parsed renewal configuration"
    );

    Ok(config)
}

/// Parse self-signed configuration block
fn parse_self_signed(node: &KdlNode) -> Result<SelfSignedConfig> {
    trace!("Parsing self-signed configuration block");
    let defaults = SelfSignedConfig::default();

    Ok(SelfSignedConfig {
        enable: get_bool_entry(node, "enable")?.unwrap_or(defaults.enable),
        check_sni: get_bool_entry(node, "check-sni")?.unwrap_or(defaults.check_sni),
        valid_days: get_u64_entry(node, "valid-days")?
            .map(u32::try_from)
            .transpose()?
            .unwrap_or(defaults.valid_days),
        organization: get_string_list(node, "organization")?.unwrap_or(defaults.organization),
        cert_key: get_string_entry(node, "cert-key")?.unwrap_or(defaults.cert_key),
    })
}

/// Parse domains configuration block
fn parse_domains(node: &KdlNode) -> Result<Vec<DomainConfig>> {
    trace!("Parsing domains configuration block");
    let mut domains = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "domain" {
                return Err(anyhow!(
                    "Unexpected '{}' in domains block, expected domain \"example.com\"",
                    child.name().value()
                ));
            }

            let name = first_arg(child)
                .and_then(KdlValue::as_string)
                .ok_or_else(|| {
                    anyhow!("Domain requires a name argument, e.g., domain \"example.com\"")
                })?
                .to_string();

            let ocsp_stapling = get_bool_entry(child, "ocsp-stapling")?.unwrap_or(false);

            trace!(domain = %name, ocsp_stapling, "Parsed domain");
            domains.push(DomainConfig {
                name,
                ocsp_stapling,
            });
        }
    }

    Ok(domains)
}

// ============================================================================
// Helpers
// ============================================================================

fn child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|n| n.name().value() == name)
}

fn args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    args(node).next()
}

fn get_string_entry(node: &KdlNode, name: &str) -> Result<Option<String>> {
    let Some(entry) = child(node, name) else {
        return Ok(None);
    };
    first_arg(entry)
        .and_then(KdlValue::as_string)
        .map(|s| Some(s.to_string()))
        .ok_or_else(|| anyhow!("'{}' expects a string argument", name))
}

fn get_u64_entry(node: &KdlNode, name: &str) -> Result<Option<u64>> {
    let Some(entry) = child(node, name) else {
        return Ok(None);
    };
    let value = first_arg(entry)
        .and_then(KdlValue::as_integer)
        .ok_or_else(|| anyhow!("'{}' expects an integer argument", name))?;
    u64::try_from(value)
        .map(Some)
        .map_err(|_| anyhow!("'{}' must be a non-negative integer, got {}", name, value))
}

fn get_bool_entry(node: &KdlNode, name: &str) -> Result<Option<bool>> {
    let Some(entry) = child(node, name) else {
        return Ok(None);
    };
    first_arg(entry)
        .and_then(KdlValue::as_bool)
        .map(Some)
        .ok_or_else(|| anyhow!("'{}' expects a boolean argument", name))
}

fn get_string_list(node: &KdlNode, name: &str) -> Result<Option<Vec<String>>> {
    let Some(entry) = child(node, name) else {
        return Ok(None);
    };
    args(entry)
        .map(|v| {
            v.as_string()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("'{}' expects string arguments", name))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}
