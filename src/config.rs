use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::constants;
use crate::models::inventory::{LocationLimits, LocationType};
use crate::services::reorder::ReorderPolicy;
use crate::utils::parse_timezone;

/// Which storage backend the ledger runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    SqlServer,
    Memory,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlserver" | "mssql" => Ok(StoreKind::SqlServer),
            "memory" => Ok(StoreKind::Memory),
            other => bail!("Unknown LEDGER_STORE '{other}' (expected 'sqlserver' or 'memory')"),
        }
    }
}

/// Limits applied to newly created location records, per location type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationDefaults {
    pub warehouse: LocationLimits,
    pub shelf: LocationLimits,
    pub online: LocationLimits,
}

impl LocationDefaults {
    pub fn for_location(&self, location: LocationType) -> LocationLimits {
        match location {
            LocationType::Warehouse => self.warehouse,
            LocationType::Shelf => self.shelf,
            LocationType::Online => self.online,
        }
    }
}

impl Default for LocationDefaults {
    fn default() -> Self {
        Self {
            warehouse: LocationLimits {
                capacity: constants::DEFAULT_WAREHOUSE_CAPACITY,
                safety_floor: constants::DEFAULT_WAREHOUSE_SAFETY_FLOOR,
            },
            shelf: LocationLimits {
                capacity: constants::DEFAULT_SHELF_CAPACITY,
                safety_floor: constants::DEFAULT_SHELF_SAFETY_FLOOR,
            },
            online: LocationLimits {
                capacity: constants::DEFAULT_ONLINE_CAPACITY,
                safety_floor: constants::DEFAULT_ONLINE_SAFETY_FLOOR,
            },
        }
    }
}

/// Ledger settings parsed once at startup
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub store_kind: StoreKind,
    pub memory_seed_file: Option<String>,
    pub location_defaults: LocationDefaults,
    pub reorder: ReorderPolicy,
    pub reorder_evaluation_interval: Option<Duration>,
    pub cart_ttl: Duration,
    pub cart_sweep_interval: Duration,
    pub checkout_timeout: Duration,
    pub timezone: Tz,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            store_kind: StoreKind::SqlServer,
            memory_seed_file: None,
            location_defaults: LocationDefaults::default(),
            reorder: ReorderPolicy::default(),
            reorder_evaluation_interval: None,
            cart_ttl: Duration::from_secs(constants::DEFAULT_CART_TTL_SECS),
            cart_sweep_interval: Duration::from_secs(constants::DEFAULT_CART_SWEEP_INTERVAL_SECS),
            checkout_timeout: Duration::from_millis(constants::DEFAULT_CHECKOUT_TIMEOUT_MS),
            timezone: chrono_tz::Asia::Bangkok,
        }
    }
}

impl LedgerSettings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self> {
        let store_kind = env::var("LEDGER_STORE")
            .unwrap_or_else(|_| "sqlserver".to_string())
            .parse::<StoreKind>()?;

        let timezone_name = env::var("STORE_TIMEZONE")
            .unwrap_or_else(|_| constants::DEFAULT_STORE_TIMEZONE.to_string());
        let timezone = parse_timezone(&timezone_name)
            .with_context(|| format!("Invalid STORE_TIMEZONE '{timezone_name}'"))?;

        let location_defaults = LocationDefaults {
            warehouse: LocationLimits {
                capacity: env_or("WAREHOUSE_CAPACITY", constants::DEFAULT_WAREHOUSE_CAPACITY),
                safety_floor: env_or(
                    "WAREHOUSE_SAFETY_FLOOR",
                    constants::DEFAULT_WAREHOUSE_SAFETY_FLOOR,
                ),
            },
            shelf: LocationLimits {
                capacity: env_or("SHELF_CAPACITY", constants::DEFAULT_SHELF_CAPACITY),
                safety_floor: env_or("SHELF_SAFETY_FLOOR", constants::DEFAULT_SHELF_SAFETY_FLOOR),
            },
            online: LocationLimits {
                capacity: env_or("ONLINE_CAPACITY", constants::DEFAULT_ONLINE_CAPACITY),
                safety_floor: env_or(
                    "ONLINE_SAFETY_FLOOR",
                    constants::DEFAULT_ONLINE_SAFETY_FLOOR,
                ),
            },
        };

        let reorder = ReorderPolicy {
            safety_floor: env_or("REORDER_SAFETY_FLOOR", constants::REORDER_SAFETY_FLOOR),
            default_capacity: env_or("REORDER_DEFAULT_CAPACITY", constants::DEFAULT_REORDER_CAPACITY),
            velocity_window_days: env_or(
                "SALES_VELOCITY_WINDOW_DAYS",
                constants::SALES_VELOCITY_WINDOW_DAYS,
            ),
        };

        let evaluation_secs: u64 = env_or(
            "REORDER_EVALUATION_INTERVAL_SECS",
            constants::DEFAULT_REORDER_EVALUATION_INTERVAL_SECS,
        );

        let settings = Self {
            store_kind,
            memory_seed_file: env::var("MEMORY_SEED_FILE").ok().filter(|s| !s.trim().is_empty()),
            location_defaults,
            reorder,
            reorder_evaluation_interval: (evaluation_secs > 0)
                .then(|| Duration::from_secs(evaluation_secs)),
            cart_ttl: Duration::from_secs(env_or("CART_TTL_SECS", constants::DEFAULT_CART_TTL_SECS)),
            cart_sweep_interval: Duration::from_secs(env_or(
                "CART_SWEEP_INTERVAL_SECS",
                constants::DEFAULT_CART_SWEEP_INTERVAL_SECS,
            )),
            checkout_timeout: Duration::from_millis(env_or(
                "CHECKOUT_TIMEOUT_MS",
                constants::DEFAULT_CHECKOUT_TIMEOUT_MS,
            )),
            timezone,
        };

        info!(
            store = ?settings.store_kind,
            timezone = %settings.timezone,
            safety_floor = settings.reorder.safety_floor,
            cart_ttl_secs = settings.cart_ttl.as_secs(),
            "⚙️ Ledger settings loaded"
        );

        Ok(settings)
    }
}

/// Read an environment variable, falling back to the default when unset or unparsable
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("⚠️ Invalid value '{}' for {}, using default {}", raw, key, default);
                default
            }
        },
        Err(_) => default,
    }
}
