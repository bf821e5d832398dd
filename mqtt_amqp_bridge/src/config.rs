//! Bridge configuration for the MQTT protocol processor.

use std::collections::HashMap;

/// All the settings consumed by the per-connection processor.
///
/// Values are looked up by the embedding application (static configuration
/// plus runtime parameters) and handed to the processor at construction.
#[derive(Builder, Clone, Debug)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct BridgeConfig {
    /// AMQP exchange used for all bindings and publishes
    #[builder(default = "String::from(\"amq.topic\")")]
    pub(crate) exchange: String,
    /// Default vhost when no other selection strategy applies
    #[builder(default = "String::from(\"/\")")]
    pub(crate) vhost: String,
    /// Username substituted for anonymous connections
    #[builder(default = "None")]
    pub(crate) default_user: Option<String>,
    /// Password substituted for anonymous connections
    #[builder(default = "None")]
    pub(crate) default_pass: Option<String>,
    /// Whether connections without credentials may fall back to the
    /// configured default user
    #[builder(default = "true")]
    pub(crate) allow_anonymous: bool,
    /// Whether a TLS client certificate common name may be used as the
    /// login name
    #[builder(default = "false")]
    pub(crate) ssl_cert_login: bool,
    /// When false, a colon in the username selects the vhost
    /// (`vhost:username`)
    #[builder(default = "false")]
    pub(crate) ignore_colons_in_username: bool,
    /// Prefetch window applied to the consume channel via `basic.qos`
    #[builder(default = "10")]
    pub(crate) prefetch: u16,
    /// Queue expiry in milliseconds applied to non-clean-session QoS-1
    /// queues (`x-expires`); `None` disables expiry
    #[builder(default = "Some(86_400_000)")]
    pub(crate) subscription_ttl: Option<u64>,
    /// Runtime parameter: TLS certificate common name to vhost
    #[builder(default)]
    pub(crate) default_vhosts: HashMap<String, String>,
    /// Runtime parameter: listener port (as a string) to vhost
    #[builder(default)]
    pub(crate) port_vhost_mapping: HashMap<String, String>,
}

impl BridgeConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(exchange) = &self.exchange {
            if exchange.is_empty() {
                return Err("exchange must not be empty".to_string());
            }
        }
        if let Some(vhost) = &self.vhost {
            if vhost.is_empty() {
                return Err("vhost must not be empty".to_string());
            }
        }
        if let Some(prefetch) = &self.prefetch {
            if *prefetch == 0 {
                return Err("prefetch must be greater than zero".to_string());
            }
        }
        Ok(())
    }
}

impl BridgeConfig {
    /// AMQP exchange used for all bindings and publishes.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Default vhost when no other selection strategy applies.
    #[must_use]
    pub fn vhost(&self) -> &str {
        &self.vhost
    }
}
