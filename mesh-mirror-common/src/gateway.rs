use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde::Deserialize;
use thiserror::Error;

use crate::{GATEWAY_CONFIG_KEY, KUBECONFIG_KEY};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("secret {secret} is missing data key {key}")]
    MissingKey { secret: String, key: &'static str },

    #[error("data key {0} is not valid utf-8")]
    NotUtf8(&'static str),

    #[error("failed to parse gateway config: {0}")]
    YamlConversion(#[from] serde_yaml::Error),

    #[error("gateway config for cluster {0} has no addresses")]
    NoAddresses(String),
}

/// Gateway probe schedule, decoded once per credentials secret.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    pub path: String,
    pub port: u16,
    pub period_seconds: u64,
}

/// The YAML document stored under the `config` key of a credentials secret.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub cluster_name: String,
    pub gateway_name: String,
    pub gateway_namespace: String,
    pub addresses: Vec<String>,
    pub incoming_port: u16,
    pub identity: String,
    pub probe: ProbeConfig,
}

/// Immutable description of a cluster's gateway. Replaced wholesale when
/// the owning credentials secret changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewaySpec {
    pub gateway_name: String,
    pub gateway_namespace: String,
    pub cluster_name: String,
    pub addresses: Vec<String>,
    pub incoming_port: u16,
    pub resource_version: String,
    pub identity: String,
    pub probe: ProbeConfig,
}

impl GatewaySpec {
    pub fn from_config(config: GatewayConfig, resource_version: String) -> Self {
        Self {
            gateway_name: config.gateway_name,
            gateway_namespace: config.gateway_namespace,
            cluster_name: config.cluster_name,
            addresses: config.addresses,
            incoming_port: config.incoming_port,
            resource_version,
            identity: config.identity,
            probe: config.probe,
        }
    }
}

/// Everything the registry needs to run one remote cluster: the raw
/// kubeconfig and the decoded gateway spec.
#[derive(Clone, Debug)]
pub struct RemoteClusterCredentials {
    pub kubeconfig: String,
    pub spec: GatewaySpec,
}

impl RemoteClusterCredentials {
    pub fn cluster_name(&self) -> &str {
        &self.spec.cluster_name
    }
}

/// Decodes a credentials secret. Any missing or malformed field is an
/// error for the caller to log and skip, never a panic.
pub fn decode_credentials_secret(secret: &Secret) -> Result<RemoteClusterCredentials, DecodeError> {
    let kubeconfig = secret_string(secret, KUBECONFIG_KEY)?;
    let raw_config = secret_string(secret, GATEWAY_CONFIG_KEY)?;

    let config: GatewayConfig = serde_yaml::from_str(&raw_config)?;
    if config.addresses.is_empty() {
        return Err(DecodeError::NoAddresses(config.cluster_name));
    }

    let resource_version = secret.resource_version().unwrap_or_default();
    Ok(RemoteClusterCredentials {
        kubeconfig,
        spec: GatewaySpec::from_config(config, resource_version),
    })
}

fn secret_string(secret: &Secret, key: &'static str) -> Result<String, DecodeError> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| DecodeError::MissingKey {
            secret: secret.name_any(),
            key,
        })?;
    String::from_utf8(bytes.0.clone()).map_err(|_| DecodeError::NotUtf8(key))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    use super::*;

    const CONFIG: &str = r#"
clusterName: east
gatewayName: gateway
gatewayNamespace: mesh-gateway
addresses:
  - 10.0.0.5
incomingPort: 4143
identity: gateway.mesh-gateway.serviceaccount.identity.east
probe:
  path: /health
  port: 4181
  periodSeconds: 3
"#;

    fn make_secret(data: Vec<(&str, &str)>) -> Secret {
        let data: BTreeMap<String, ByteString> = data
            .into_iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect();
        Secret {
            metadata: ObjectMeta {
                name: Some("cluster-east".into()),
                namespace: Some("mesh-mirror".into()),
                resource_version: Some("41".into()),
                ..Default::default()
            },
            data: Some(data),
            type_: Some(crate::MIRROR_SECRET_TYPE.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_credentials() {
        let secret = make_secret(vec![("kubeconfig", "apiVersion: v1"), ("config", CONFIG)]);
        let creds = decode_credentials_secret(&secret).expect("decode");
        assert_eq!(creds.cluster_name(), "east");
        assert_eq!(creds.kubeconfig, "apiVersion: v1");
        assert_eq!(creds.spec.addresses, vec!["10.0.0.5".to_string()]);
        assert_eq!(creds.spec.incoming_port, 4143);
        assert_eq!(creds.spec.resource_version, "41");
        assert_eq!(creds.spec.probe.path, "/health");
        assert_eq!(creds.spec.probe.period_seconds, 3);
    }

    #[test]
    fn test_decode_missing_kubeconfig() {
        let secret = make_secret(vec![("config", CONFIG)]);
        let err = decode_credentials_secret(&secret).expect_err("missing key");
        assert!(matches!(
            err,
            DecodeError::MissingKey {
                key: "kubeconfig",
                ..
            }
        ));
    }

    #[test]
    fn test_decode_malformed_config() {
        let secret = make_secret(vec![("kubeconfig", "apiVersion: v1"), ("config", "{nope")]);
        let err = decode_credentials_secret(&secret).expect_err("bad yaml");
        assert!(matches!(err, DecodeError::YamlConversion(_)));
    }

    #[test]
    fn test_decode_rejects_empty_addresses() {
        let config = CONFIG.replace("  - 10.0.0.5\n", "");
        let config = config.replace("addresses:", "addresses: []");
        let secret = make_secret(vec![("kubeconfig", "apiVersion: v1"), ("config", &config)]);
        let err = decode_credentials_secret(&secret).expect_err("no addresses");
        assert!(matches!(err, DecodeError::NoAddresses(c) if c == "east"));
    }
}
