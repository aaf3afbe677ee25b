//! Empirical dispatch constants. All of them can be overridden through
//! `DispatchSettings::from_env`.

pub const DEFAULT_MAX_ORDERS_PER_BATCH: usize = 3;
pub const DEFAULT_MAX_DEVIATION_KM: f64 = 5.0;
pub const DEFAULT_MAX_DISTANCE_BETWEEN_ORDERS_KM: f64 = 10.0;

pub const DEFAULT_PREP_WINDOW_MINUTES: i64 = 30;
pub const DEFAULT_PREP_TIME_PENALTY: f64 = 0.3;
pub const DEFAULT_MULTI_VENDOR_SCORE: f64 = 0.8;
pub const DEFAULT_COMPATIBILITY_THRESHOLD: f64 = 0.7;

pub const DEFAULT_AVERAGE_SPEED_KMH: f64 = 40.0;
/// Score points lost per route kilometre
pub const DEFAULT_SCORE_PENALTY_PER_KM: f64 = 2.0;

pub const DEFAULT_SEARCH_RADIUS_KM: f64 = 15.0;
pub const DEFAULT_MAX_DRIVER_WORKLOAD: i32 = 5;
pub const DEFAULT_PERFORMANCE_SCORE: f64 = 0.7;

pub const DEFAULT_DISTANCE_WEIGHT: f64 = 0.4;
pub const DEFAULT_WORKLOAD_WEIGHT: f64 = 0.3;
pub const DEFAULT_PERFORMANCE_WEIGHT: f64 = 0.2;
pub const DEFAULT_BATCH_FIT_WEIGHT: f64 = 0.1;

pub const DEFAULT_OVERLOAD_FACTOR: f64 = 1.5;
pub const DEFAULT_UNDERLOAD_FACTOR: f64 = 0.5;

pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_STORE_MAX_RETRIES: u32 = 1;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;
pub const DEFAULT_CONFLICT_MAX_RETRIES: u32 = 2;

pub const DEFAULT_SWEEP_PARALLELISM: usize = 4;
pub const DEFAULT_SWEEP_POOL_LIMIT: i64 = 500;
