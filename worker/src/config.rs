use std::{env, str::FromStr, time::Duration};

const DEFAULT_WORKER_CONCURRENCY: usize = 2;
const DEFAULT_GROUP: &str = "default";
const DEFAULT_JOBS: usize = 3;
const DEFAULT_FRAGMENTS: usize = 8;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_WORK_MS: u64 = 50;
const DEFAULT_FAIL_RATE: f64 = 0.2;
const DEFAULT_STALE_SECS: u64 = 20;
const DEFAULT_SWEEP_SECS: u64 = 5;
const DEFAULT_IDLE_MS: u64 = 200;

/// Configuración del worker, leída una vez de variables de entorno.
#[derive(Debug, Clone)]
pub struct Config {
    pub concurrency: usize,
    pub group: String,
    /// Jobs simulados que se cargan al arrancar.
    pub jobs: usize,
    pub fragments: usize,
    pub max_attempts: u32,
    pub work: Duration,
    pub fail_rate: f64,
    /// Tiempo sin cambios tras el cual un fragmento en proceso se devuelve.
    pub stale_after: Duration,
    pub sweep_every: Duration,
    pub idle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            group: DEFAULT_GROUP.to_string(),
            jobs: DEFAULT_JOBS,
            fragments: DEFAULT_FRAGMENTS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            work: Duration::from_millis(DEFAULT_WORK_MS),
            fail_rate: DEFAULT_FAIL_RATE,
            stale_after: Duration::from_secs(DEFAULT_STALE_SECS),
            sweep_every: Duration::from_secs(DEFAULT_SWEEP_SECS),
            idle: Duration::from_millis(DEFAULT_IDLE_MS),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            concurrency: env_or("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY).max(1),
            group: env::var("WORKER_GROUP").unwrap_or_else(|_| DEFAULT_GROUP.to_string()),
            jobs: env_or("WORKER_JOBS", DEFAULT_JOBS),
            fragments: env_or("WORKER_FRAGMENTS", DEFAULT_FRAGMENTS),
            max_attempts: env_or("WORKER_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS).max(1),
            work: Duration::from_millis(env_or("WORKER_WORK_MS", DEFAULT_WORK_MS)),
            // gen_bool sólo acepta [0, 1]
            fail_rate: env_or("WORKER_FAIL_RATE", DEFAULT_FAIL_RATE).clamp(0.0, 1.0),
            stale_after: Duration::from_secs(env_or("WORKER_STALE_SECS", DEFAULT_STALE_SECS)),
            sweep_every: Duration::from_secs(env_or("WORKER_SWEEP_SECS", DEFAULT_SWEEP_SECS).max(1)),
            idle: Duration::from_millis(env_or("WORKER_IDLE_MS", DEFAULT_IDLE_MS)),
        }
    }
}
