//! Application configuration.
//!
//! The configuration file is human-edited JSON produced at enrollment time.
//! It is loaded once at startup into an immutable value; everything the
//! tunnel needs afterwards is materialized into [`EnrollmentIdentity`] and
//! [`TunnelParams`] and handed down explicitly.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::pkcs8::DecodePublicKey;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TunnelError;

/// Duration that deserializes from either integer nanoseconds or a human
/// string such as `"3s"` or `"1m"`. Serializes as nanoseconds so both input
/// forms round-trip to the same numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn get(self) -> Duration {
        self.0
    }
}

impl From<Duration> for ConfigDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl fmt::Display for ConfigDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0.as_nanos() as u64)
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Nanos(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Nanos(n) => Ok(Self(Duration::from_nanos(n))),
            Raw::Text(s) => humantime::parse_duration(&s)
                .map(Self)
                .map_err(|e| D::Error::custom(format!("invalid duration {s:?}: {e}"))),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Proxy frontend binding and optional authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub bind_address: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Whether this frontend should run. The subcommand-based CLI makes the
    /// invocation itself the enable switch, so this only warns when false;
    /// it is kept so enrolled config files round-trip without loss.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: String::new(),
            port: String::new(),
            username: String::new(),
            password: String::new(),
            enabled: default_enabled(),
        }
    }
}

fn default_connect_port() -> u16 {
    443
}

fn default_dns() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
        IpAddr::V4(Ipv4Addr::new(149, 112, 112, 112)),
        "2620:fe::fe".parse().unwrap(),
        "2620:fe::9".parse().unwrap(),
    ]
}

fn default_dns_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(2)
}

fn default_keepalive() -> ConfigDuration {
    ConfigDuration::from_secs(30)
}

fn default_mtu() -> usize {
    1280
}

fn default_initial_packet_size() -> u16 {
    1242
}

fn default_reconnect_delay() -> ConfigDuration {
    ConfigDuration::from_secs(1)
}

fn default_connection_timeout() -> ConfigDuration {
    ConfigDuration::from_secs(30)
}

/// MASQUE tunnel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_connect_port")]
    pub connect_port: u16,
    #[serde(default = "default_dns")]
    pub dns: Vec<IpAddr>,
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout: ConfigDuration,
    #[serde(default)]
    pub use_ipv6: bool,
    #[serde(default)]
    pub no_tunnel_ipv4: bool,
    #[serde(default)]
    pub no_tunnel_ipv6: bool,
    #[serde(default)]
    pub sni_address: String,
    #[serde(default = "default_keepalive")]
    pub keepalive_period: ConfigDuration,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default = "default_initial_packet_size")]
    pub initial_packet_size: u16,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: ConfigDuration,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: ConfigDuration,
    /// Zero disables the datagram-idle watchdog.
    #[serde(default)]
    pub idle_timeout: ConfigDuration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_port: default_connect_port(),
            dns: default_dns(),
            dns_timeout: default_dns_timeout(),
            use_ipv6: false,
            no_tunnel_ipv4: false,
            no_tunnel_ipv6: false,
            sni_address: String::new(),
            keepalive_period: default_keepalive(),
            mtu: default_mtu(),
            initial_packet_size: default_initial_packet_size(),
            reconnect_delay: default_reconnect_delay(),
            connection_timeout: default_connection_timeout(),
            idle_timeout: ConfigDuration::default(),
        }
    }
}

/// Enrollment state plus frontend and tunnel settings, as persisted on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base64 of the DER-encoded ECDSA P-256 device key.
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub endpoint_v4: String,
    #[serde(default)]
    pub endpoint_v6: String,
    /// PEM-encoded ECDSA public key pinned for peer verification.
    #[serde(default)]
    pub endpoint_pub_key: String,
    /// Opaque enrollment identifiers, carried but unused at runtime.
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub access_token: String,
    /// Inner addresses assigned by the provider.
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub socks: ProxyConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl Config {
    /// Load the configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Write the configuration back as prettified JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = serde_json::to_string_pretty(self).context("encoding config")?;
        std::fs::write(path, data)
            .with_context(|| format!("writing config file {}", path.display()))
    }

    /// Decode the enrolled device key (base64 of SEC1 DER).
    pub fn ec_private_key(&self) -> Result<p256::SecretKey, TunnelError> {
        let der = BASE64
            .decode(self.private_key.trim())
            .map_err(|e| TunnelError::KeyMaterial(format!("private key base64: {e}")))?;
        p256::SecretKey::from_sec1_der(&der)
            .map_err(|e| TunnelError::KeyMaterial(format!("private key DER: {e}")))
    }

    /// Decode the pinned endpoint public key (PEM SPKI).
    pub fn endpoint_public_key(&self) -> Result<p256::PublicKey, TunnelError> {
        p256::PublicKey::from_public_key_pem(self.endpoint_pub_key.trim())
            .map_err(|e| TunnelError::KeyMaterial(format!("endpoint public key: {e}")))
    }
}

/// Immutable per-device identity material, decoded once at startup.
#[derive(Clone)]
pub struct EnrollmentIdentity {
    pub private_key: p256::SecretKey,
    pub endpoint_public_key: p256::PublicKey,
    pub inner_v4: Option<Ipv4Addr>,
    pub inner_v6: Option<Ipv6Addr>,
    pub endpoint_v4: Option<Ipv4Addr>,
    pub endpoint_v6: Option<Ipv6Addr>,
}

impl fmt::Debug for EnrollmentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollmentIdentity")
            .field("inner_v4", &self.inner_v4)
            .field("inner_v6", &self.inner_v6)
            .field("endpoint_v4", &self.endpoint_v4)
            .field("endpoint_v6", &self.endpoint_v6)
            .finish_non_exhaustive()
    }
}

impl EnrollmentIdentity {
    /// Materialize the identity from a loaded configuration. Missing or
    /// malformed key material is fatal; addresses are optional individually
    /// and validated against the tunnel settings later.
    pub fn from_config(config: &Config) -> Result<Self, TunnelError> {
        let private_key = config.ec_private_key()?;
        let endpoint_public_key = config.endpoint_public_key()?;

        fn parse_addr<T: std::str::FromStr>(value: &str, what: &str) -> Result<Option<T>, TunnelError>
        where
            T::Err: fmt::Display,
        {
            if value.is_empty() {
                return Ok(None);
            }
            value
                .parse()
                .map(Some)
                .map_err(|e| TunnelError::Config(format!("{what} {value:?}: {e}")))
        }

        Ok(Self {
            private_key,
            endpoint_public_key,
            inner_v4: parse_addr(&config.ipv4, "inner IPv4 address")?,
            inner_v6: parse_addr(&config.ipv6, "inner IPv6 address")?,
            endpoint_v4: parse_addr(&config.endpoint_v4, "endpoint IPv4 address")?,
            endpoint_v6: parse_addr(&config.endpoint_v6, "endpoint IPv6 address")?,
        })
    }

    /// Inner addresses to bind the virtual stack to, honoring the per-family
    /// suppression switches.
    pub fn tunnel_addresses(&self, no_v4: bool, no_v6: bool) -> Vec<IpAddr> {
        let mut addrs = Vec::new();
        if !no_v4 {
            if let Some(v4) = self.inner_v4 {
                addrs.push(IpAddr::V4(v4));
            }
        }
        if !no_v6 {
            if let Some(v6) = self.inner_v6 {
                addrs.push(IpAddr::V6(v6));
            }
        }
        addrs
    }

    /// Outer endpoint address for the chosen family. `use_ipv6 = false`
    /// selects the v4 endpoint, which is the historical default.
    pub fn endpoint(&self, use_ipv6: bool, port: u16) -> Result<SocketAddr, TunnelError> {
        let ip = if use_ipv6 {
            self.endpoint_v6
                .map(IpAddr::V6)
                .ok_or_else(|| TunnelError::Config("no IPv6 endpoint enrolled".into()))?
        } else {
            self.endpoint_v4
                .map(IpAddr::V4)
                .ok_or_else(|| TunnelError::Config("no IPv4 endpoint enrolled".into()))?
        };
        Ok(SocketAddr::new(ip, port))
    }
}

/// Immutable per-run tunnel parameters.
#[derive(Debug, Clone)]
pub struct TunnelParams {
    pub endpoint: SocketAddr,
    pub sni: String,
    pub keepalive_period: Duration,
    pub initial_packet_size: u16,
    pub mtu: usize,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::{EncodePublicKey, LineEnding};

    fn enrolled_config() -> Config {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let endpoint_key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        Config {
            private_key: BASE64.encode(key.to_sec1_der().unwrap().as_slice()),
            endpoint_pub_key: endpoint_key
                .public_key()
                .to_public_key_pem(LineEnding::LF)
                .unwrap(),
            endpoint_v4: "162.159.198.1".into(),
            endpoint_v6: "2606:4700:103::1".into(),
            ipv4: "172.16.0.2".into(),
            ipv6: "2606:4700:110:8566::1".into(),
            ..Config::default()
        }
    }

    #[test]
    fn duration_accepts_both_forms() {
        let nanos: ConfigDuration = serde_json::from_str("3000000000").unwrap();
        let text: ConfigDuration = serde_json::from_str("\"3s\"").unwrap();
        assert_eq!(nanos, text);
        assert_eq!(nanos.get(), Duration::from_secs(3));

        let minute: ConfigDuration = serde_json::from_str("\"1m\"").unwrap();
        assert_eq!(minute.get(), Duration::from_secs(60));
    }

    #[test]
    fn duration_serializes_as_nanos() {
        let d = ConfigDuration::from_secs(2);
        assert_eq!(serde_json::to_string(&d).unwrap(), "2000000000");
    }

    #[test]
    fn duration_rejects_garbage() {
        assert!(serde_json::from_str::<ConfigDuration>("\"soonish\"").is_err());
    }

    #[test]
    fn config_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = enrolled_config();
        config.tunnel.dns_timeout = ConfigDuration::from_secs(3);
        config.socks.username = "u".into();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);

        // Saving the loaded value again must not change it.
        loaded.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), loaded);
    }

    #[test]
    fn missing_tunnel_section_gets_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tunnel.connect_port, 443);
        assert_eq!(config.tunnel.mtu, 1280);
        assert_eq!(config.tunnel.initial_packet_size, 1242);
        assert_eq!(config.tunnel.reconnect_delay.get(), Duration::from_secs(1));
        assert_eq!(config.tunnel.dns.len(), 4);
    }

    #[test]
    fn socks_enabled_defaults_on_and_roundtrips() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.socks.enabled);

        let config: Config =
            serde_json::from_str(r#"{"socks": {"enabled": false}}"#).unwrap();
        assert!(!config.socks.enabled);

        let json = serde_json::to_string(&config).unwrap();
        let reparsed: Config = serde_json::from_str(&json).unwrap();
        assert!(!reparsed.socks.enabled, "enabled must survive a save");
    }

    #[test]
    fn key_material_roundtrip() {
        let config = enrolled_config();
        let key = config.ec_private_key().unwrap();
        let endpoint = config.endpoint_public_key().unwrap();
        assert_ne!(key.public_key(), endpoint);
    }

    #[test]
    fn malformed_keys_are_fatal() {
        let mut config = enrolled_config();
        config.private_key = "not base64!".into();
        let err = config.ec_private_key().unwrap_err();
        assert!(err.is_fatal());

        let mut config = enrolled_config();
        config.endpoint_pub_key = "-----BEGIN NONSENSE-----".into();
        assert!(config.endpoint_public_key().unwrap_err().is_fatal());
    }

    #[test]
    fn identity_honors_family_suppression() {
        let config = enrolled_config();
        let identity = EnrollmentIdentity::from_config(&config).unwrap();

        assert_eq!(identity.tunnel_addresses(false, false).len(), 2);
        assert_eq!(identity.tunnel_addresses(true, false).len(), 1);
        assert!(identity.tunnel_addresses(true, true).is_empty());
    }

    #[test]
    fn endpoint_family_selection() {
        let config = enrolled_config();
        let identity = EnrollmentIdentity::from_config(&config).unwrap();

        let v4 = identity.endpoint(false, 443).unwrap();
        assert!(v4.is_ipv4());
        assert_eq!(v4.port(), 443);

        let v6 = identity.endpoint(true, 4443).unwrap();
        assert!(v6.is_ipv6());
    }
}
