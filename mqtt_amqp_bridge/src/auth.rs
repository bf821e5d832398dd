//! Credential and vhost resolution for the CONNECT handshake.
//!
//! Pure functions mapping what the client presented (username, password,
//! TLS certificate common name, listener port) to the effective AMQP
//! login and virtual host. Identical inputs always yield identical
//! outputs; all configuration is passed in explicitly.

use bytes::Bytes;
use thiserror::Error;

use crate::config::BridgeConfig;

/// Failure to derive a usable login from the CONNECT packet.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CredentialError {
    /// Exactly one of username/password was supplied
    #[error("invalid credentials: username and password must be supplied together")]
    InvalidCreds,
    /// No credentials were supplied and no fallback applies
    #[error("no credentials supplied")]
    NoCreds,
}

/// The effective AMQP login derived from a CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    /// Effective login name
    pub username: String,
    /// Password; `None` marks TLS-certificate authentication
    pub password: Option<Bytes>,
}

/// How the virtual host was chosen, reported for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VhostStrategy {
    /// TLS certificate common name matched the CN-to-vhost runtime map
    CertToVhostMapping,
    /// The listener port matched the port-to-vhost runtime map
    PortToVhostMapping,
    /// The username carried a `vhost:username` prefix, or the configured
    /// default applied on the TLS path
    VhostInUsernameOrDefault,
    /// The configured default vhost applied
    DefaultVhost,
}

impl VhostStrategy {
    /// Human-readable tag for log lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            VhostStrategy::CertToVhostMapping => "cert_to_vhost_mapping",
            VhostStrategy::PortToVhostMapping => "port_to_vhost_mapping",
            VhostStrategy::VhostInUsernameOrDefault => "vhost_in_username_or_default",
            VhostStrategy::DefaultVhost => "default_vhost",
        }
    }
}

/// The virtual host and (possibly rewritten) username for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostSelection {
    /// Selected virtual host
    pub vhost: String,
    /// Username with any vhost prefix stripped
    pub username: String,
    /// Which strategy produced the selection
    pub strategy: VhostStrategy,
}

/// Derive the effective AMQP login from what the client presented.
///
/// Selection priority:
/// 1. username and password both present;
/// 2. exactly one present is an error;
/// 3. TLS certificate login, when enabled and a common name is available;
/// 4. the configured default user/pass, when anonymous access is allowed;
/// 5. otherwise no credentials.
///
/// # Errors
/// [`CredentialError::InvalidCreds`] or [`CredentialError::NoCreds`] per
/// the priority rules above; CONNECT maps both to `bad-username-or-password`.
pub fn resolve_credentials(
    username: Option<&str>,
    password: Option<&Bytes>,
    ssl_login_name: Option<&str>,
    config: &BridgeConfig,
) -> Result<ResolvedCredentials, CredentialError> {
    match (username, password) {
        (Some(user), Some(pass)) => Ok(ResolvedCredentials {
            username: user.to_string(),
            password: Some(pass.clone()),
        }),
        (Some(_), None) | (None, Some(_)) => Err(CredentialError::InvalidCreds),
        (None, None) => {
            if config.ssl_cert_login {
                if let Some(cn) = ssl_login_name {
                    return Ok(ResolvedCredentials {
                        username: cn.to_string(),
                        password: None,
                    });
                }
            }
            if config.allow_anonymous {
                if let (Some(user), Some(pass)) = (&config.default_user, &config.default_pass) {
                    return Ok(ResolvedCredentials {
                        username: user.clone(),
                        password: Some(Bytes::from(pass.clone().into_bytes())),
                    });
                }
            }
            Err(CredentialError::NoCreds)
        }
    }
}

/// Select the virtual host for a connection.
///
/// Without a TLS common name: a colon in the username splits it at the
/// LAST colon into `vhost:username` (unless colons are ignored), then the
/// port-to-vhost runtime map is consulted, then the configured default
/// applies. With a common name: the CN-to-vhost runtime map is consulted
/// first, then the port map, then the username-split/default path.
#[must_use]
pub fn select_vhost(
    username: &str,
    ssl_login_name: Option<&str>,
    listener_port: u16,
    config: &BridgeConfig,
) -> VhostSelection {
    if let Some(cn) = ssl_login_name {
        if let Some(vhost) = config.default_vhosts.get(cn) {
            return VhostSelection {
                vhost: vhost.clone(),
                username: username.to_string(),
                strategy: VhostStrategy::CertToVhostMapping,
            };
        }
        if let Some(vhost) = vhost_from_port(listener_port, config) {
            return VhostSelection {
                vhost,
                username: username.to_string(),
                strategy: VhostStrategy::PortToVhostMapping,
            };
        }
        let (vhost, username) = split_vhost_username(username, config);
        return VhostSelection {
            vhost,
            username,
            strategy: VhostStrategy::VhostInUsernameOrDefault,
        };
    }

    if !config.ignore_colons_in_username && username.contains(':') {
        let (vhost, username) = split_vhost_username(username, config);
        return VhostSelection {
            vhost,
            username,
            strategy: VhostStrategy::VhostInUsernameOrDefault,
        };
    }
    if let Some(vhost) = vhost_from_port(listener_port, config) {
        return VhostSelection {
            vhost,
            username: username.to_string(),
            strategy: VhostStrategy::PortToVhostMapping,
        };
    }
    VhostSelection {
        vhost: config.vhost().to_string(),
        username: username.to_string(),
        strategy: VhostStrategy::DefaultVhost,
    }
}

/// Split `vhost:username` at the LAST colon, mirroring the original
/// adapter's `":(?!.*?:)"` delimiter. Falls back to the configured
/// default vhost when no colon is present or colons are ignored.
fn split_vhost_username(username: &str, config: &BridgeConfig) -> (String, String) {
    if !config.ignore_colons_in_username {
        if let Some((vhost, user)) = username.rsplit_once(':') {
            return (vhost.to_string(), user.to_string());
        }
    }
    (config.vhost().to_string(), username.to_string())
}

fn vhost_from_port(listener_port: u16, config: &BridgeConfig) -> Option<String> {
    config
        .port_vhost_mapping
        .get(&listener_port.to_string())
        .cloned()
}
