//! Pilot feature flags.
//!
//! The control plane reads its tuning knobs from environment variables. The
//! framework loads them once into [`PilotFeatures`] and hands that struct to
//! the Pilot component, so tests can override individual flags without
//! touching the process environment.

use crate::config::ConfigError;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Default port for HTTP PROXY mode. Can be overridden by mesh config.
pub const DEFAULT_PORT_HTTP_PROXY: u16 = 15002;

/// Default termination drain duration when the variable is unset or invalid.
pub const DEFAULT_TERMINATION_DRAIN_DURATION: Duration = Duration::from_secs(5);

/// Pilot tuning flags.
#[derive(Debug, Clone, PartialEq)]
pub struct PilotFeatures {
    /// Location of mTLS certificates (`PILOT_CERT_DIR`). Empty means the platform default.
    pub cert_dir: String,

    /// Max concurrent gRPC streams (`ISTIO_GPRC_MAXSTREAMS`).
    pub max_concurrent_streams: u32,

    /// Mesh-wide trace sampling percentage, 0.0 - 100.0 (`PILOT_TRACE_SAMPLING`).
    pub trace_sampling: f64,

    /// Pushes per second (`PILOT_PUSH_THROTTLE`).
    pub push_throttle: u32,

    /// Push burst (`PILOT_PUSH_BURST`).
    pub push_burst: u32,

    /// Save config snapshots for debugging (`PILOT_DEBUG_ADSZ_CONFIG`).
    pub debug_configs: bool,

    /// Periodic full refresh, zero disables (`V2_REFRESH`).
    pub refresh_duration: Duration,

    /// Delay after a config event before pushing (`PILOT_DEBOUNCE_AFTER`).
    pub debounce_after: Duration,

    /// Upper bound on debouncing (`PILOT_DEBOUNCE_MAX`).
    pub debounce_max: Duration,

    /// Return endpoints from all namespaces (`PILOT_DISABLE_EDS_ISOLATION`, any value).
    pub disable_eds_isolation: bool,

    /// Accept HTTP/1.0 on outbound listeners (`PILOT_HTTP10`).
    pub http10: bool,

    /// Connection drain time on agent shutdown (`TERMINATION_DRAIN_DURATION_SECONDS`).
    pub termination_drain_duration: Duration,

    /// Precompute CDS output per namespace (`PILOT_ENABLE_CDS_PRECOMPUTATION`, any value).
    pub enable_cds_precomputation: bool,

    /// Locality load balancing (`PILOT_ENABLE_LOCALITY_LOAD_BALANCING`, any value).
    pub enable_locality_load_balancing: bool,

    /// Wait for cache sync before serving (`PILOT_ENABLE_WAIT_CACHE_SYNC`, `"0"` disables).
    pub enable_wait_cache_sync: bool,

    /// Disable marshaling xDS resources to `Any` (`PILOT_DISABLE_XDS_MARSHALING_TO_ANY=1`).
    pub disable_xds_marshaling_to_any: bool,
}

impl Default for PilotFeatures {
    fn default() -> Self {
        Self {
            cert_dir: String::new(),
            max_concurrent_streams: 100_000,
            trace_sampling: 100.0,
            push_throttle: 10,
            push_burst: 100,
            debug_configs: false,
            refresh_duration: Duration::ZERO,
            debounce_after: Duration::from_millis(100),
            debounce_max: Duration::from_secs(10),
            disable_eds_isolation: false,
            http10: false,
            termination_drain_duration: DEFAULT_TERMINATION_DRAIN_DURATION,
            enable_cds_precomputation: false,
            enable_locality_load_balancing: false,
            enable_wait_cache_sync: true,
            disable_xds_marshaling_to_any: false,
        }
    }
}

impl PilotFeatures {
    /// Load flags from a variable map, falling back to defaults for unset variables.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let present = |name: &str| vars.get(name).is_some_and(|v| !v.is_empty());

        let features = Self {
            cert_dir: vars.get("PILOT_CERT_DIR").cloned().unwrap_or_default(),
            max_concurrent_streams: parse_or(
                vars,
                "ISTIO_GPRC_MAXSTREAMS",
                defaults.max_concurrent_streams,
            )?,
            trace_sampling: parse_or(vars, "PILOT_TRACE_SAMPLING", defaults.trace_sampling)?,
            push_throttle: parse_or(vars, "PILOT_PUSH_THROTTLE", defaults.push_throttle)?,
            push_burst: parse_or(vars, "PILOT_PUSH_BURST", defaults.push_burst)?,
            debug_configs: parse_bool_or(vars, "PILOT_DEBUG_ADSZ_CONFIG", defaults.debug_configs)?,
            refresh_duration: duration_or(vars, "V2_REFRESH", defaults.refresh_duration)?,
            debounce_after: duration_or(vars, "PILOT_DEBOUNCE_AFTER", defaults.debounce_after)?,
            debounce_max: duration_or(vars, "PILOT_DEBOUNCE_MAX", defaults.debounce_max)?,
            disable_eds_isolation: present("PILOT_DISABLE_EDS_ISOLATION"),
            http10: parse_bool_or(vars, "PILOT_HTTP10", defaults.http10)?,
            termination_drain_duration: termination_drain_duration(vars),
            enable_cds_precomputation: present("PILOT_ENABLE_CDS_PRECOMPUTATION"),
            enable_locality_load_balancing: present("PILOT_ENABLE_LOCALITY_LOAD_BALANCING"),
            enable_wait_cache_sync: vars
                .get("PILOT_ENABLE_WAIT_CACHE_SYNC")
                .map_or(true, |v| v != "0"),
            disable_xds_marshaling_to_any: vars
                .get("PILOT_DISABLE_XDS_MARSHALING_TO_ANY")
                .is_some_and(|v| v == "1"),
        };

        features.validate()?;
        Ok(features)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.trace_sampling) {
            return Err(ConfigError::InvalidValue {
                name: "PILOT_TRACE_SAMPLING".to_string(),
                message: format!("must be within 0.0 - 100.0, got {}", self.trace_sampling),
            });
        }

        if self.max_concurrent_streams == 0 {
            return Err(ConfigError::InvalidValue {
                name: "ISTIO_GPRC_MAXSTREAMS".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.debounce_after > self.debounce_max {
            return Err(ConfigError::InvalidValue {
                name: "PILOT_DEBOUNCE_AFTER".to_string(),
                message: format!(
                    "{:?} exceeds PILOT_DEBOUNCE_MAX {:?}",
                    self.debounce_after, self.debounce_max
                ),
            });
        }

        Ok(())
    }
}

fn parse_or<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        Some(value) => value.trim().parse().map_err(|e| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{}': {}", value, e),
        }),
        None => Ok(default),
    }
}

fn parse_bool_or(
    vars: &HashMap<String, String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(name).map(|v| v.trim()) {
        None => Ok(default),
        Some("1" | "t" | "T" | "true" | "TRUE" | "True") => Ok(true),
        Some("0" | "f" | "F" | "false" | "FALSE" | "False") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{}' is not a boolean", other),
        }),
    }
}

fn duration_or(
    vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(value) => parse_duration(value).map_err(|message| ConfigError::InvalidDuration {
            name: name.to_string(),
            message,
        }),
        None => Ok(default),
    }
}

fn termination_drain_duration(vars: &HashMap<String, String>) -> Duration {
    let Some(value) = vars
        .get("TERMINATION_DRAIN_DURATION_SECONDS")
        .filter(|v| !v.is_empty())
    else {
        return DEFAULT_TERMINATION_DRAIN_DURATION;
    };

    match value.trim().parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => {
            warn!(
                target: "mesh_test.config",
                value = %value,
                default = ?DEFAULT_TERMINATION_DRAIN_DURATION,
                "Unable to parse TERMINATION_DRAIN_DURATION_SECONDS, using default"
            );
            DEFAULT_TERMINATION_DRAIN_DURATION
        }
    }
}

/// Parse a duration such as `"300ms"`, `"10s"` or `"2h45m"`.
///
/// Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. A bare `"0"` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_nanos = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let (number, tail) = rest.split_at(number_end);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number '{}' in duration '{}'", number, input))?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let nanos_per_unit = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration '{}'", input)),
            other => return Err(format!("unknown unit '{}' in duration '{}'", other, input)),
        };

        total_nanos += value * nanos_per_unit;
        rest = next;
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(
            parse_duration("2h45m").unwrap(),
            Duration::from_secs(2 * 3600 + 45 * 60)
        );
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_rejects_bad_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("5 days").is_err());
    }

    #[test]
    fn test_defaults_match_control_plane() {
        let features = PilotFeatures::from_vars(&HashMap::new()).unwrap();
        assert_eq!(features, PilotFeatures::default());
        assert_eq!(features.max_concurrent_streams, 100_000);
        assert_eq!(features.debounce_after, Duration::from_millis(100));
        assert_eq!(features.debounce_max, Duration::from_secs(10));
        assert!(features.enable_wait_cache_sync);
        assert!(!features.disable_xds_marshaling_to_any);
    }

    #[test]
    fn test_presence_flags() {
        let vars = HashMap::from([
            ("PILOT_DISABLE_EDS_ISOLATION".to_string(), "yes".to_string()),
            ("PILOT_ENABLE_CDS_PRECOMPUTATION".to_string(), "x".to_string()),
            ("PILOT_ENABLE_LOCALITY_LOAD_BALANCING".to_string(), String::new()),
            ("PILOT_ENABLE_WAIT_CACHE_SYNC".to_string(), "0".to_string()),
            ("PILOT_DISABLE_XDS_MARSHALING_TO_ANY".to_string(), "1".to_string()),
            ("PILOT_HTTP10".to_string(), "true".to_string()),
        ]);

        let features = PilotFeatures::from_vars(&vars).unwrap();
        assert!(features.disable_eds_isolation);
        assert!(features.enable_cds_precomputation);
        assert!(!features.enable_locality_load_balancing);
        assert!(!features.enable_wait_cache_sync);
        assert!(features.disable_xds_marshaling_to_any);
        assert!(features.http10);
    }

    #[test]
    fn test_termination_drain_duration_falls_back_on_garbage() {
        let vars = HashMap::from([(
            "TERMINATION_DRAIN_DURATION_SECONDS".to_string(),
            "soon".to_string(),
        )]);
        let features = PilotFeatures::from_vars(&vars).unwrap();
        assert_eq!(
            features.termination_drain_duration,
            DEFAULT_TERMINATION_DRAIN_DURATION
        );

        let vars = HashMap::from([(
            "TERMINATION_DRAIN_DURATION_SECONDS".to_string(),
            "12".to_string(),
        )]);
        let features = PilotFeatures::from_vars(&vars).unwrap();
        assert_eq!(features.termination_drain_duration, Duration::from_secs(12));
    }

    #[test]
    fn test_validation() {
        let vars = HashMap::from([("PILOT_TRACE_SAMPLING".to_string(), "150".to_string())]);
        assert!(PilotFeatures::from_vars(&vars).is_err());

        let vars = HashMap::from([
            ("PILOT_DEBOUNCE_AFTER".to_string(), "20s".to_string()),
            ("PILOT_DEBOUNCE_MAX".to_string(), "10s".to_string()),
        ]);
        assert!(PilotFeatures::from_vars(&vars).is_err());

        let vars = HashMap::from([("PILOT_PUSH_BURST".to_string(), "lots".to_string())]);
        assert!(PilotFeatures::from_vars(&vars).is_err());
    }
}
