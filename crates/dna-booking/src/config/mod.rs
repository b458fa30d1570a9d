use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::booking::{
    AllocationConfig, BookingConfig, ReservationConfig, SampleType, StaffCapacityPolicy,
};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub booking: BookingSettings,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let format = match env::var("APP_LOG_FORMAT") {
            Ok(raw) => LogFormat::parse(&raw).ok_or(ConfigError::InvalidLogFormat { value: raw })?,
            Err(_) => LogFormat::Compact,
        };

        let default_sample_type = match env::var("BOOKING_DEFAULT_SAMPLE_TYPE") {
            Ok(raw) => {
                SampleType::parse(&raw).ok_or(ConfigError::InvalidSampleType { value: raw })?
            }
            Err(_) => SampleType::Saliva,
        };

        let booking = BookingSettings {
            staff_slot_limit: numeric_var("BOOKING_STAFF_SLOT_LIMIT", 3)?,
            default_sample_type,
            max_samples_per_request: numeric_var("BOOKING_MAX_SAMPLES_PER_REQUEST", 10)?,
            reservation_hold_hours: numeric_var("BOOKING_RESERVATION_HOLD_HOURS", 48)?,
            sweep_interval_secs: numeric_var("BOOKING_SWEEP_INTERVAL_SECS", 300)?,
        };
        booking.validate()?;

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level, format },
            booking,
        })
    }
}

fn numeric_var<T: FromStr>(variable: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(variable) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { variable, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Full,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub format: LogFormat,
}

/// Engine defaults read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSettings {
    pub staff_slot_limit: u32,
    pub default_sample_type: SampleType,
    pub max_samples_per_request: usize,
    pub reservation_hold_hours: i64,
    pub sweep_interval_secs: u64,
}

impl BookingSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 4] = [
            ("BOOKING_STAFF_SLOT_LIMIT", self.staff_slot_limit > 0),
            (
                "BOOKING_MAX_SAMPLES_PER_REQUEST",
                self.max_samples_per_request > 0,
            ),
            (
                "BOOKING_RESERVATION_HOLD_HOURS",
                self.reservation_hold_hours > 0,
            ),
            ("BOOKING_SWEEP_INTERVAL_SECS", self.sweep_interval_secs > 0),
        ];
        match checks.into_iter().find(|(_, positive)| !positive) {
            Some((variable, _)) => Err(ConfigError::NotPositive { variable }),
            None => Ok(()),
        }
    }

    pub fn booking_config(&self) -> BookingConfig {
        BookingConfig {
            allocation: AllocationConfig {
                default_sample_type: self.default_sample_type,
                max_samples_per_request: self.max_samples_per_request,
            },
            capacity: StaffCapacityPolicy::new(self.staff_slot_limit),
            reservations: ReservationConfig {
                hold: Duration::hours(self.reservation_hold_hours),
            },
        }
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidLogFormat { value: String },
    InvalidSampleType { value: String },
    InvalidNumber { variable: &'static str, value: String },
    NotPositive { variable: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidLogFormat { value } => {
                write!(f, "APP_LOG_FORMAT must be `compact` or `full`, got '{value}'")
            }
            ConfigError::InvalidSampleType { value } => write!(
                f,
                "BOOKING_DEFAULT_SAMPLE_TYPE must be saliva, blood, hair or other, got '{value}'"
            ),
            ConfigError::InvalidNumber { variable, value } => {
                write!(f, "{variable} must be a number, got '{value}'")
            }
            ConfigError::NotPositive { variable } => {
                write!(f, "{variable} must be greater than zero")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for variable in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "APP_LOG_FORMAT",
            "BOOKING_STAFF_SLOT_LIMIT",
            "BOOKING_DEFAULT_SAMPLE_TYPE",
            "BOOKING_MAX_SAMPLES_PER_REQUEST",
            "BOOKING_RESERVATION_HOLD_HOURS",
            "BOOKING_SWEEP_INTERVAL_SECS",
        ] {
            env::remove_var(variable);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.telemetry.format, LogFormat::Compact);

        let booking = config.booking.booking_config();
        assert_eq!(booking, BookingConfig::default());
        assert_eq!(config.booking.sweep_interval(), StdDuration::from_secs(300));
    }

    #[test]
    fn booking_overrides_flow_into_engine_config() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("BOOKING_STAFF_SLOT_LIMIT", "5");
        env::set_var("BOOKING_DEFAULT_SAMPLE_TYPE", "Blood");
        env::set_var("BOOKING_RESERVATION_HOLD_HOURS", "24");
        let config = AppConfig::load().expect("config loads");
        reset_env();

        let booking = config.booking.booking_config();
        assert_eq!(booking.capacity.default_limit, 5);
        assert_eq!(booking.allocation.default_sample_type, SampleType::Blood);
        assert_eq!(booking.reservations.hold, Duration::hours(24));
    }

    #[test]
    fn rejects_unparseable_and_zero_values() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("BOOKING_MAX_SAMPLES_PER_REQUEST", "many");
        let err = AppConfig::load().expect_err("not a number");
        assert!(err.to_string().contains("BOOKING_MAX_SAMPLES_PER_REQUEST"));

        reset_env();
        env::set_var("BOOKING_SWEEP_INTERVAL_SECS", "0");
        let err = AppConfig::load().expect_err("zero interval");
        assert!(matches!(
            err,
            ConfigError::NotPositive {
                variable: "BOOKING_SWEEP_INTERVAL_SECS"
            }
        ));

        reset_env();
        env::set_var("APP_LOG_FORMAT", "pretty");
        let err = AppConfig::load().expect_err("unknown format");
        assert!(matches!(err, ConfigError::InvalidLogFormat { .. }));
        reset_env();
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        reset_env();
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
    }
}
