// Application Constants
// Centralized constants to avoid magic numbers

/// Default server configuration
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: u16 = 4410;

/// Database connection defaults
pub const DEFAULT_DATABASE_PORT: u16 = 1433;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;

/// Pool monitoring interval
pub const POOL_MONITOR_INTERVAL_SECS: u64 = 60;
pub const POOL_HIGH_USAGE_THRESHOLD: f64 = 80.0;
pub const POOL_ELEVATED_USAGE_THRESHOLD: f64 = 70.0;

/// Per-record capacity applied when stock is first placed at a location
pub const DEFAULT_WAREHOUSE_CAPACITY: i32 = 10_000;
pub const DEFAULT_SHELF_CAPACITY: i32 = 500;
pub const DEFAULT_ONLINE_CAPACITY: i32 = 2_000;

/// Per-record safety floor applied when stock is first placed at a location
pub const DEFAULT_WAREHOUSE_SAFETY_FLOOR: i32 = 50;
pub const DEFAULT_SHELF_SAFETY_FLOOR: i32 = 10;
pub const DEFAULT_ONLINE_SAFETY_FLOOR: i32 = 10;

/// Reorder policy
pub const REORDER_SAFETY_FLOOR: i32 = 50;
pub const DEFAULT_REORDER_CAPACITY: i32 = 200;
pub const SALES_VELOCITY_WINDOW_DAYS: i64 = 30;
/// 0 disables the background evaluation loop
pub const DEFAULT_REORDER_EVALUATION_INTERVAL_SECS: u64 = 0;

/// Cart and checkout
pub const DEFAULT_CART_TTL_SECS: u64 = 60 * 60 * 2;
pub const DEFAULT_CART_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_CHECKOUT_TIMEOUT_MS: u64 = 5_000;
pub const ORDER_CODE_MAX_ATTEMPTS: usize = 5;

pub const MAX_REASON_LENGTH: usize = 200;

/// Query limits
pub const DEFAULT_MOVEMENT_LIMIT: u32 = 50;
pub const MAX_MOVEMENT_LIMIT: u32 = 500;
pub const DEFAULT_EXPIRY_WINDOW_DAYS: i64 = 30;
pub const MAX_EXPIRY_WINDOW_DAYS: i64 = 3650;

pub const DEFAULT_STORE_TIMEZONE: &str = "Asia/Bangkok";
