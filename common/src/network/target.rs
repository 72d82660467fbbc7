//! # Assessment Target Model
//!
//! A [`Target`] is a network (access point) or a device observed by a scan.
//! Targets are keyed by their hardware address (MAC for stations, BSSID for
//! access points). Repeated observations of the same address are merged into
//! the existing record; records are never removed, only considered stale once
//! their last sighting is older than the configured age.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
pub use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};

/// Link-layer protection advertised by a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Open,
    Wep,
    Wpa,
    Wpa2,
    Wpa3,
    Unknown,
}

impl SecurityMode {
    /// Score penalty applied by the report's security grade.
    pub fn risk_penalty(self) -> u32 {
        match self {
            SecurityMode::Wep => 20,
            SecurityMode::Open => 15,
            SecurityMode::Wpa | SecurityMode::Wpa2 => 5,
            SecurityMode::Wpa3 | SecurityMode::Unknown => 0,
        }
    }
}

impl FromStr for SecurityMode {
    type Err = std::convert::Infallible;

    /// Parses the free-form strings printed by survey tools
    /// (e.g. "WPA2-PSK", "wpa3 sae", "OPN", "WEP").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let mode = if lower.contains("wpa3") || lower.contains("sae") {
            SecurityMode::Wpa3
        } else if lower.contains("wpa2") || lower.contains("rsn") {
            SecurityMode::Wpa2
        } else if lower.contains("wpa") {
            SecurityMode::Wpa
        } else if lower.contains("wep") {
            SecurityMode::Wep
        } else if lower == "open" || lower == "opn" || lower == "none" {
            SecurityMode::Open
        } else {
            SecurityMode::Unknown
        };
        Ok(mode)
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityMode::Open => "Open",
            SecurityMode::Wep => "WEP",
            SecurityMode::Wpa => "WPA",
            SecurityMode::Wpa2 => "WPA2",
            SecurityMode::Wpa3 => "WPA3",
            SecurityMode::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(with = "mac_serde")]
    pub id: MacAddr,
    pub name: Option<String>,
    pub ip: Option<IpAddr>,
    /// Signal strength in dBm.
    pub signal_dbm: Option<i32>,
    pub security: SecurityMode,
    pub channel: Option<u16>,
    pub vendor: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Target {
    pub fn new(id: MacAddr) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: None,
            ip: None,
            signal_dbm: None,
            security: SecurityMode::Unknown,
            channel: None,
            vendor: None,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    pub fn with_signal(mut self, dbm: i32) -> Self {
        self.signal_dbm = Some(dbm);
        self
    }

    /// Human readable label: the advertised name, else the address.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    /// Merges a newer sighting of the same address into this record.
    ///
    /// `first_seen` is preserved; every other attribute takes the newer value
    /// when the newer sighting carries one.
    pub fn observe(&mut self, sighting: &Target) {
        debug_assert_eq!(self.id, sighting.id);
        if sighting.last_seen > self.last_seen {
            self.last_seen = sighting.last_seen;
        }
        if sighting.name.is_some() {
            self.name = sighting.name.clone();
        }
        if sighting.ip.is_some() {
            self.ip = sighting.ip;
        }
        if sighting.signal_dbm.is_some() {
            self.signal_dbm = sighting.signal_dbm;
        }
        if sighting.channel.is_some() {
            self.channel = sighting.channel;
        }
        if sighting.vendor.is_some() {
            self.vendor = sighting.vendor.clone();
        }
        if sighting.security != SecurityMode::Unknown {
            self.security = sighting.security;
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.last_seen > max_age
    }
}

/// Serializes [`MacAddr`] as its canonical `aa:bb:cc:dd:ee:ff` form.
pub mod mac_serde {
    use pnet::util::MacAddr;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(mac: &MacAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(mac)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<MacAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<MacAddr>()
            .map_err(|e| D::Error::custom(format!("invalid MAC address '{s}': {e:?}")))
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn mac() -> MacAddr {
        MacAddr(0x00, 0x11, 0x22, 0x33, 0x44, 0x55)
    }

    #[test]
    fn security_mode_parses_survey_strings() {
        assert_eq!("WPA2-PSK".parse(), Ok(SecurityMode::Wpa2));
        assert_eq!("WPA3 SAE".parse(), Ok(SecurityMode::Wpa3));
        assert_eq!("wpa-psk".parse(), Ok(SecurityMode::Wpa));
        assert_eq!("WEP".parse(), Ok(SecurityMode::Wep));
        assert_eq!("OPN".parse(), Ok(SecurityMode::Open));
        assert_eq!("mystery".parse(), Ok(SecurityMode::Unknown));
    }

    #[test]
    fn observe_keeps_first_seen_and_takes_newer_values() {
        let mut original = Target::new(mac()).with_name("cafe-guest").with_signal(-70);
        let first_seen = original.first_seen;

        let mut sighting = Target::new(mac())
            .with_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
            .with_signal(-48);
        sighting.last_seen = original.last_seen + Duration::seconds(30);

        original.observe(&sighting);

        assert_eq!(original.first_seen, first_seen);
        assert_eq!(original.last_seen, sighting.last_seen);
        assert_eq!(original.signal_dbm, Some(-48));
        assert_eq!(original.name.as_deref(), Some("cafe-guest"));
        assert!(original.ip.is_some());
    }

    #[test]
    fn staleness_is_relative_to_last_seen() {
        let target = Target::new(mac());
        let later = target.last_seen + Duration::minutes(10);
        assert!(target.is_stale(later, Duration::minutes(5)));
        assert!(!target.is_stale(later, Duration::minutes(15)));
    }
}
