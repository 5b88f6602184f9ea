use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::limits::*;
use crate::model::parse_bay_number;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

// ── Zones ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSpec {
    pub name: String,
    pub bays: u32,
}

/// Static zone layout: name → bay count, in display order. Never derived from
/// booking data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneConfig {
    zones: Vec<ZoneSpec>,
}

impl ZoneConfig {
    pub fn new(zones: Vec<ZoneSpec>) -> Result<Self, ConfigError> {
        if zones.is_empty() {
            return Err(ConfigError("at least one zone is required".into()));
        }
        if zones.len() > MAX_ZONES {
            return Err(ConfigError(format!("too many zones (max {MAX_ZONES})")));
        }
        for (i, zone) in zones.iter().enumerate() {
            if zone.name.trim().is_empty() {
                return Err(ConfigError("zone name must not be empty".into()));
            }
            if zone.name.len() > MAX_ZONE_NAME_LEN {
                return Err(ConfigError(format!("zone name too long: {}", zone.name)));
            }
            if zone.bays == 0 || zone.bays > MAX_BAYS_PER_ZONE {
                return Err(ConfigError(format!(
                    "{}: bay count must be 1..={MAX_BAYS_PER_ZONE}, got {}",
                    zone.name, zone.bays
                )));
            }
            if zones[..i]
                .iter()
                .any(|z| z.name.trim().eq_ignore_ascii_case(zone.name.trim()))
            {
                return Err(ConfigError(format!("duplicate zone: {}", zone.name)));
            }
        }
        let zones = zones
            .into_iter()
            .map(|z| ZoneSpec {
                name: z.name.trim().to_string(),
                bays: z.bays,
            })
            .collect();
        Ok(Self { zones })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ZoneSpec> {
        self.zones.iter()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Look up a zone by name, ignoring surrounding whitespace and case.
    pub fn zone(&self, name: &str) -> Option<&ZoneSpec> {
        let name = name.trim();
        self.zones.iter().find(|z| z.name.eq_ignore_ascii_case(name))
    }

    /// Resolve a bay label within a zone. `None` if either is unknown or the
    /// bay number exceeds the zone's capacity.
    pub fn resolve_bay(&self, zone: &str, bay: &str) -> Option<(&ZoneSpec, u32)> {
        let spec = self.zone(zone)?;
        let number = parse_bay_number(bay)?;
        (number <= spec.bays).then_some((spec, number))
    }
}

impl Default for ZoneConfig {
    /// The yard as mapped: one bay in Zone 1, then five, four and five.
    fn default() -> Self {
        Self {
            zones: [("Zone 1", 1), ("Zone 2", 5), ("Zone 3", 4), ("Zone 4", 5)]
                .into_iter()
                .map(|(name, bays)| ZoneSpec {
                    name: name.to_string(),
                    bays,
                })
                .collect(),
        }
    }
}

impl FromStr for ZoneConfig {
    type Err = ConfigError;

    /// `"Zone 1=1;Zone 2=5"`. Empty entries are skipped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut zones = Vec::new();
        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, bays) = entry
                .rsplit_once('=')
                .ok_or_else(|| ConfigError(format!("expected NAME=BAYS, got {entry:?}")))?;
            let bays = bays
                .trim()
                .parse::<u32>()
                .map_err(|e| ConfigError(format!("{}: bad bay count: {e}", name.trim())))?;
            zones.push(ZoneSpec {
                name: name.trim().to_string(),
                bays,
            });
        }
        Self::new(zones)
    }
}

// ── Secrets ──────────────────────────────────────────────────────

/// A credential supplied through the environment. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

// ── Server settings ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Json,
}

impl TableFormat {
    /// Guess from the file extension; anything but `.json` is CSV.
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => TableFormat::Json,
            _ => TableFormat::Csv,
        }
    }
}

impl FromStr for TableFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(TableFormat::Csv),
            "json" => Ok(TableFormat::Json),
            other => Err(ConfigError(format!("unknown table format: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub table_path: PathBuf,
    pub table_format: TableFormat,
    pub cache_ttl: Duration,
    pub zones: ZoneConfig,
    pub office_user: String,
    /// `None` disables the office role; every login is then read-only.
    pub office_secret: Option<Secret>,
    pub viewer_password: Secret,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, so tests need not touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match var("YARD_PORT") {
            Some(p) => p
                .trim()
                .parse()
                .map_err(|e| ConfigError(format!("YARD_PORT: {e}")))?,
            None => 5434,
        };
        let table_path =
            PathBuf::from(var("YARD_TABLE_PATH").unwrap_or_else(|| "./data/schedule.csv".into()));
        let table_format = match var("YARD_TABLE_FORMAT") {
            Some(f) => f.parse()?,
            None => TableFormat::for_path(&table_path),
        };
        let cache_ttl = match var("YARD_CACHE_TTL_SECS") {
            Some(s) => Duration::from_secs(
                s.trim()
                    .parse()
                    .map_err(|e| ConfigError(format!("YARD_CACHE_TTL_SECS: {e}")))?,
            ),
            None => Duration::from_secs(3),
        };
        let zones = match var("YARD_ZONES") {
            Some(z) => z.parse()?,
            None => ZoneConfig::default(),
        };
        let max_connections = match var("YARD_MAX_CONNECTIONS") {
            Some(s) => s
                .trim()
                .parse()
                .map_err(|e| ConfigError(format!("YARD_MAX_CONNECTIONS: {e}")))?,
            None => 256,
        };
        let metrics_port = match var("YARD_METRICS_PORT") {
            Some(p) => Some(
                p.trim()
                    .parse()
                    .map_err(|e| ConfigError(format!("YARD_METRICS_PORT: {e}")))?,
            ),
            None => None,
        };

        Ok(Self {
            bind: var("YARD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            table_path,
            table_format,
            cache_ttl,
            zones,
            office_user: var("YARD_OFFICE_USER").unwrap_or_else(|| "office".into()),
            office_secret: var("YARD_OFFICE_SECRET").map(Secret::new),
            viewer_password: Secret::new(var("YARD_VIEWER_PASSWORD").unwrap_or_else(|| "yard".into())),
            max_connections,
            metrics_port,
            tls_cert: var("YARD_TLS_CERT"),
            tls_key: var("YARD_TLS_KEY"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn default_zones_match_yard_map() {
        let zones = ZoneConfig::default();
        let layout: Vec<(&str, u32)> = zones.iter().map(|z| (z.name.as_str(), z.bays)).collect();
        assert_eq!(layout, vec![("Zone 1", 1), ("Zone 2", 5), ("Zone 3", 4), ("Zone 4", 5)]);
    }

    #[test]
    fn parse_zone_config() {
        let zones: ZoneConfig = " North = 2 ; South=3; ".parse().unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones.zone("north").unwrap().bays, 2);
        assert_eq!(zones.zone(" SOUTH ").unwrap().name, "South");
        assert!(zones.zone("East").is_none());
    }

    #[test]
    fn zone_config_rejects_bad_input() {
        assert!("".parse::<ZoneConfig>().is_err());
        assert!("A".parse::<ZoneConfig>().is_err());
        assert!("A=x".parse::<ZoneConfig>().is_err());
        assert!("A=0".parse::<ZoneConfig>().is_err());
        assert!(format!("A={}", MAX_BAYS_PER_ZONE + 1).parse::<ZoneConfig>().is_err());
        assert!("A=1;a=2".parse::<ZoneConfig>().is_err());
    }

    #[test]
    fn resolve_bay_respects_capacity() {
        let zones = ZoneConfig::default();
        let (spec, n) = zones.resolve_bay("zone 3", "Bay 4").unwrap();
        assert_eq!((spec.name.as_str(), n), ("Zone 3", 4));
        assert!(zones.resolve_bay("Zone 3", "Bay 5").is_none());
        assert!(zones.resolve_bay("Zone 9", "Bay 1").is_none());
        assert!(zones.resolve_bay("Zone 1", "Gate").is_none());
    }

    #[test]
    fn config_defaults() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 5434);
        assert_eq!(cfg.table_format, TableFormat::Csv);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(3));
        assert_eq!(cfg.office_user, "office");
        assert!(cfg.office_secret.is_none());
        assert_eq!(cfg.zones, ZoneConfig::default());
        assert!(cfg.tls_cert.is_none() && cfg.tls_key.is_none());
    }

    #[test]
    fn config_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("YARD_PORT", "6000"),
            ("YARD_TABLE_PATH", "/tmp/yard.JSON"),
            ("YARD_CACHE_TTL_SECS", "5"),
            ("YARD_ZONES", "Zone A=2"),
            ("YARD_OFFICE_SECRET", "s3cret"),
            ("YARD_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.table_format, TableFormat::Json);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(5));
        assert_eq!(cfg.zones.zone("Zone A").unwrap().bays, 2);
        assert_eq!(cfg.office_secret.as_ref().map(Secret::expose), Some("s3cret"));
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn blank_secret_disables_office() {
        let cfg = Config::from_lookup(lookup(&[("YARD_OFFICE_SECRET", "  ")])).unwrap();
        assert!(cfg.office_secret.is_none());
    }

    #[test]
    fn secret_debug_is_redacted() {
        let s = Secret::new("hunter2");
        assert_eq!(format!("{s:?}"), "Secret(***)");
    }

    #[test]
    fn bad_numbers_are_errors() {
        assert!(Config::from_lookup(lookup(&[("YARD_PORT", "http")])).is_err());
        assert!(Config::from_lookup(lookup(&[("YARD_CACHE_TTL_SECS", "-1")])).is_err());
        assert!(Config::from_lookup(lookup(&[("YARD_TABLE_FORMAT", "xlsx")])).is_err());
        assert!(Config::from_lookup(lookup(&[("YARD_METRICS_PORT", "metrics")])).is_err());
        assert!(Config::from_lookup(lookup(&[("YARD_METRICS_PORT", "70000")])).is_err());
    }
}
