//! Configuration of the middleware.
//!
//! Both structs are plain data: build them once (by hand, or deserialized from whatever config
//! format the server bootstrap uses) and hand them to the layer constructors.

use std::time::Duration;

use faststr::FastStr;
use serde::{Deserialize, Serialize};

/// Default address of the collector daemon.
pub const DEFAULT_DAEMON_ADDRESS: &str = "127.0.0.1:2000";
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RENEW_PERIOD: Duration = Duration::from_secs(60);

/// Options of the request ID layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestIdConfig {
    /// Use the incoming `X-Request-Id` value, when present, instead of generating a new ID.
    pub trust_incoming_id: bool,
    /// Truncate trusted incoming IDs to this many bytes. `0` means no limit.
    pub max_id_length: usize,
}

impl RequestIdConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trust_incoming_id(mut self, trust: bool) -> Self {
        self.trust_incoming_id = trust;
        self
    }

    pub fn with_max_id_length(mut self, max: usize) -> Self {
        self.max_id_length = max;
        self
    }
}

/// Options of the tracing layers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XrayConfig {
    /// Name of the service reported to the collector.
    pub service_name: FastStr,
    /// `host:port` of the collector daemon.
    pub daemon_address: FastStr,
    /// How long resolving and connecting to the daemon may take.
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,
    /// How often the daemon is re-dialed. `None` or zero disables re-dialing.
    #[serde(with = "opt_duration_ms")]
    pub renew_period: Option<Duration>,
}

impl Default for XrayConfig {
    fn default() -> Self {
        Self {
            service_name: FastStr::empty(),
            daemon_address: FastStr::from_static_str(DEFAULT_DAEMON_ADDRESS),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            renew_period: Some(DEFAULT_RENEW_PERIOD),
        }
    }
}

impl XrayConfig {
    pub fn new(service_name: impl Into<FastStr>, daemon_address: impl Into<FastStr>) -> Self {
        Self {
            service_name: service_name.into(),
            daemon_address: daemon_address.into(),
            ..Default::default()
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_renew_period(mut self, period: Option<Duration>) -> Self {
        self.renew_period = period;
        self
    }

    /// The period the daemon is re-dialed at. A zero period disables re-dialing.
    pub fn renewal(&self) -> Option<Duration> {
        self.renew_period.filter(|period| !period.is_zero())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.filter(|&ms| ms > 0).map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_defaults_to_always_generate() {
        let config = RequestIdConfig::default();
        assert!(!config.trust_incoming_id);
        assert_eq!(config.max_id_length, 0);
    }

    #[test]
    fn xray_config_from_json() {
        let config: XrayConfig = serde_json::from_str(
            r#"{"service_name": "calc", "dial_timeout": 250, "renew_period": null}"#,
        )
        .unwrap();
        assert_eq!(config.service_name.as_str(), "calc");
        assert_eq!(config.daemon_address.as_str(), DEFAULT_DAEMON_ADDRESS);
        assert_eq!(config.dial_timeout, Duration::from_millis(250));
        assert_eq!(config.renew_period, None);
    }

    #[test]
    fn zero_renew_period_means_no_renewal() {
        let config: XrayConfig = serde_json::from_str(r#"{"renew_period": 0}"#).unwrap();
        assert_eq!(config.renew_period, None);
        assert_eq!(config.renewal(), None);

        let config = XrayConfig::default().with_renew_period(Some(Duration::ZERO));
        assert_eq!(config.renewal(), None);
        assert_eq!(
            XrayConfig::default().renewal(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn xray_config_serializes_durations_as_millis() {
        let config = XrayConfig::new("calc", "localhost:2000");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["dial_timeout"], 5000);
        assert_eq!(json["renew_period"], 60000);
    }
}
