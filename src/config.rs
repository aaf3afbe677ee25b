//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::defaults::*;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Seconds between background grouping sweeps, 0 disables them
    pub sweep_interval_secs: u64,

    /// Seconds between background workload rebalancing passes, 0 disables them
    pub rebalance_interval_secs: u64,

    pub dispatch: DispatchSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let nats_url = std::env::var("NATS_URL")
            .unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;

        let sweep_interval_secs = env_or("SWEEP_INTERVAL_SECS", 30u64)?;
        let rebalance_interval_secs = env_or("REBALANCE_INTERVAL_SECS", 300u64)?;

        let dispatch = DispatchSettings::from_env()?;

        Ok(Self {
            nats_url,
            database_url,
            sweep_interval_secs,
            rebalance_interval_secs,
            dispatch,
        })
    }
}

/// Weights of the driver assignment score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignmentWeights {
    pub distance: f64,
    pub workload: f64,
    pub performance: f64,
    pub batch_fit: f64,
}

impl AssignmentWeights {
    pub fn total(&self) -> f64 {
        self.distance + self.workload + self.performance + self.batch_fit
    }
}

impl Default for AssignmentWeights {
    fn default() -> Self {
        Self {
            distance: DEFAULT_DISTANCE_WEIGHT,
            workload: DEFAULT_WORKLOAD_WEIGHT,
            performance: DEFAULT_PERFORMANCE_WEIGHT,
            batch_fit: DEFAULT_BATCH_FIT_WEIGHT,
        }
    }
}

/// Tunables of the batching engine
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub max_orders_per_batch: usize,
    pub max_deviation_km: f64,
    /// Absolute cap between any two delivery points
    pub max_distance_between_orders_km: f64,
    pub prep_window_minutes: i64,
    pub prep_time_penalty: f64,
    pub multi_vendor_score: f64,
    pub compatibility_threshold: f64,

    pub average_speed_kmh: f64,
    pub score_penalty_per_km: f64,

    pub search_radius_km: f64,
    pub max_driver_workload: i32,
    pub default_performance_score: f64,
    pub weights: AssignmentWeights,

    pub overload_factor: f64,
    pub underload_factor: f64,

    pub store_timeout: Duration,
    pub store_max_retries: u32,
    pub retry_backoff: Duration,
    pub conflict_max_retries: u32,

    pub sweep_parallelism: usize,
    pub sweep_pool_limit: i64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_orders_per_batch: DEFAULT_MAX_ORDERS_PER_BATCH,
            max_deviation_km: DEFAULT_MAX_DEVIATION_KM,
            max_distance_between_orders_km: DEFAULT_MAX_DISTANCE_BETWEEN_ORDERS_KM,
            prep_window_minutes: DEFAULT_PREP_WINDOW_MINUTES,
            prep_time_penalty: DEFAULT_PREP_TIME_PENALTY,
            multi_vendor_score: DEFAULT_MULTI_VENDOR_SCORE,
            compatibility_threshold: DEFAULT_COMPATIBILITY_THRESHOLD,
            average_speed_kmh: DEFAULT_AVERAGE_SPEED_KMH,
            score_penalty_per_km: DEFAULT_SCORE_PENALTY_PER_KM,
            search_radius_km: DEFAULT_SEARCH_RADIUS_KM,
            max_driver_workload: DEFAULT_MAX_DRIVER_WORKLOAD,
            default_performance_score: DEFAULT_PERFORMANCE_SCORE,
            weights: AssignmentWeights::default(),
            overload_factor: DEFAULT_OVERLOAD_FACTOR,
            underload_factor: DEFAULT_UNDERLOAD_FACTOR,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            store_max_retries: DEFAULT_STORE_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            conflict_max_retries: DEFAULT_CONFLICT_MAX_RETRIES,
            sweep_parallelism: DEFAULT_SWEEP_PARALLELISM,
            sweep_pool_limit: DEFAULT_SWEEP_POOL_LIMIT,
        }
    }
}

impl DispatchSettings {
    /// Defaults overridden by `DISPATCH_*` environment variables
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let settings = Self {
            max_orders_per_batch: env_or("DISPATCH_MAX_ORDERS_PER_BATCH", d.max_orders_per_batch)?,
            max_deviation_km: env_or("DISPATCH_MAX_DEVIATION_KM", d.max_deviation_km)?,
            max_distance_between_orders_km: env_or(
                "DISPATCH_MAX_DISTANCE_BETWEEN_ORDERS_KM",
                d.max_distance_between_orders_km,
            )?,
            prep_window_minutes: env_or("DISPATCH_PREP_WINDOW_MINUTES", d.prep_window_minutes)?,
            prep_time_penalty: env_or("DISPATCH_PREP_TIME_PENALTY", d.prep_time_penalty)?,
            multi_vendor_score: env_or("DISPATCH_MULTI_VENDOR_SCORE", d.multi_vendor_score)?,
            compatibility_threshold: env_or("DISPATCH_COMPATIBILITY_THRESHOLD", d.compatibility_threshold)?,
            average_speed_kmh: env_or("DISPATCH_AVERAGE_SPEED_KMH", d.average_speed_kmh)?,
            score_penalty_per_km: env_or("DISPATCH_SCORE_PENALTY_PER_KM", d.score_penalty_per_km)?,
            search_radius_km: env_or("DISPATCH_SEARCH_RADIUS_KM", d.search_radius_km)?,
            max_driver_workload: env_or("DISPATCH_MAX_DRIVER_WORKLOAD", d.max_driver_workload)?,
            default_performance_score: env_or("DISPATCH_DEFAULT_PERFORMANCE_SCORE", d.default_performance_score)?,
            weights: AssignmentWeights {
                distance: env_or("DISPATCH_WEIGHT_DISTANCE", d.weights.distance)?,
                workload: env_or("DISPATCH_WEIGHT_WORKLOAD", d.weights.workload)?,
                performance: env_or("DISPATCH_WEIGHT_PERFORMANCE", d.weights.performance)?,
                batch_fit: env_or("DISPATCH_WEIGHT_BATCH_FIT", d.weights.batch_fit)?,
            },
            overload_factor: env_or("DISPATCH_OVERLOAD_FACTOR", d.overload_factor)?,
            underload_factor: env_or("DISPATCH_UNDERLOAD_FACTOR", d.underload_factor)?,
            store_timeout: Duration::from_millis(env_or("DISPATCH_STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)?),
            store_max_retries: env_or("DISPATCH_STORE_MAX_RETRIES", d.store_max_retries)?,
            retry_backoff: Duration::from_millis(env_or("DISPATCH_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS)?),
            conflict_max_retries: env_or("DISPATCH_CONFLICT_MAX_RETRIES", d.conflict_max_retries)?,
            sweep_parallelism: env_or("DISPATCH_SWEEP_PARALLELISM", d.sweep_parallelism)?,
            sweep_pool_limit: env_or("DISPATCH_SWEEP_POOL_LIMIT", d.sweep_pool_limit)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would make the engine misbehave silently
    pub fn validate(&self) -> Result<()> {
        if self.max_orders_per_batch == 0 {
            anyhow::bail!("DISPATCH_MAX_ORDERS_PER_BATCH must be at least 1");
        }
        if self.max_deviation_km <= 0.0 || self.max_distance_between_orders_km <= 0.0 {
            anyhow::bail!("distance limits must be positive");
        }
        if self.prep_window_minutes <= 0 {
            anyhow::bail!("DISPATCH_PREP_WINDOW_MINUTES must be positive");
        }
        if !(0.0..=1.0).contains(&self.compatibility_threshold) {
            anyhow::bail!(
                "DISPATCH_COMPATIBILITY_THRESHOLD must be within 0..=1 (got {})",
                self.compatibility_threshold
            );
        }
        if self.average_speed_kmh <= 0.0 || self.search_radius_km <= 0.0 {
            anyhow::bail!("speed and search radius must be positive");
        }
        if self.max_driver_workload <= 0 {
            anyhow::bail!("DISPATCH_MAX_DRIVER_WORKLOAD must be positive");
        }
        let total = self.weights.total();
        if (total - 1.0).abs() > 1e-6 {
            anyhow::bail!("assignment weights must sum to 1.0 (got {:.3})", total);
        }
        if self.sweep_parallelism == 0 {
            anyhow::bail!("DISPATCH_SWEEP_PARALLELISM must be at least 1");
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        _ => Ok(default),
    }
}
