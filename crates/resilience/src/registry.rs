//! Named breaker and limiter instances
//!
//! A [`DependencyRegistry`] owns one [`CircuitBreaker`] (and optionally one
//! [`RateLimiter`]) per downstream dependency, keyed by name. Instances are
//! created lazily from [`ResilienceSettings`] on first use, or wired in
//! explicitly with [`DependencyRegistry::register`]. Every call site that
//! asks for the same name shares the same instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
use crate::config::ResilienceSettings;
use crate::error::ConfigResult;
use crate::executor::ResilienceExecutor;
use crate::rate_limiter::RateLimiter;

/// Registry of per-dependency resilience state
///
/// Cloning shares the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct DependencyRegistry {
    settings: Arc<ResilienceSettings>,
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    limiters: Arc<DashMap<String, Option<RateLimiter>>>,
}

impl DependencyRegistry {
    /// Registry using built-in defaults for every dependency
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry creating instances from validated `settings`
    pub fn from_settings(settings: ResilienceSettings) -> ConfigResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings: Arc::new(settings),
            breakers: Arc::new(DashMap::new()),
            limiters: Arc::new(DashMap::new()),
        })
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    /// Wire explicit instances for `name`, replacing any existing ones
    pub fn register(
        &self,
        name: impl Into<String>,
        breaker: CircuitBreaker,
        limiter: Option<RateLimiter>,
    ) {
        let name = name.into();
        debug!(dependency = %name, rate_limited = limiter.is_some(), "Registering dependency");
        self.breakers.insert(name.clone(), breaker);
        self.limiters.insert(name, limiter);
    }

    /// The breaker for `name`, created from settings on first use
    pub fn circuit_breaker(&self, name: &str) -> ConfigResult<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Ok(existing.value().clone());
        }

        let breaker = CircuitBreaker::new(self.settings.circuit_breaker_config_for(name)?)?;
        let entry = self.breakers.entry(name.to_owned()).or_insert(breaker);
        Ok(entry.value().clone())
    }

    /// The limiter for `name`, or `None` when the dependency is not
    /// throttled
    pub fn rate_limiter(&self, name: &str) -> ConfigResult<Option<RateLimiter>> {
        if let Some(existing) = self.limiters.get(name) {
            return Ok(existing.value().clone());
        }

        let limiter = match self.settings.rate_limiter_config_for(name)? {
            Some(config) => Some(RateLimiter::new(config)?),
            None => None,
        };
        let entry = self.limiters.entry(name.to_owned()).or_insert(limiter);
        Ok(entry.value().clone())
    }

    /// An executor wired with the retry configuration, breaker, and limiter
    /// for `name`
    pub fn executor(&self, name: &str) -> ConfigResult<ResilienceExecutor> {
        let mut executor = ResilienceExecutor::new()
            .with_retry_config(self.settings.retry_config_for(name)?)
            .with_circuit_breaker(self.circuit_breaker(name)?);

        if let Some(limiter) = self.rate_limiter(name)? {
            executor = executor.with_rate_limiter(limiter);
        }

        Ok(executor)
    }

    /// Current breaker state of every known dependency
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get_state()))
            .collect()
    }

    /// Breaker metrics of every known dependency
    pub fn metrics(&self) -> BTreeMap<String, CircuitBreakerMetrics> {
        self.breakers.iter().map(|entry| (entry.key().clone(), entry.value().metrics())).collect()
    }

    /// Dependencies whose breaker is currently open
    pub fn open_circuits(&self) -> Vec<String> {
        self.states()
            .into_iter()
            .filter(|(_, state)| *state == CircuitState::Open)
            .map(|(name, _)| name)
            .collect()
    }

    /// Reset every breaker to closed and clear every limiter window
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        for entry in self.limiters.iter() {
            if let Some(limiter) = entry.value() {
                limiter.reset();
            }
        }
        info!(dependencies = self.breakers.len(), "Reset all dependency circuit breakers");
    }

    /// Forget `name`; returns whether it was known
    ///
    /// Executors already built for it keep their handles.
    pub fn remove(&self, name: &str) -> bool {
        let had_breaker = self.breakers.remove(name).is_some();
        let had_limiter = self.limiters.remove(name).is_some();
        had_breaker || had_limiter
    }

    /// Names of every dependency with a breaker, sorted
    pub fn names(&self) -> Vec<String> {
        self.states().into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::error::RemoteError;

    const SETTINGS: &str = r#"
        [circuit_breaker]
        failure_threshold = 2

        [dependencies.payments.circuit_breaker]
        failure_threshold = 1
        open_timeout_ms = 1000

        [dependencies.search.rate_limiter]
        max_requests = 2
        window_ms = 1000
    "#;

    fn registry() -> DependencyRegistry {
        DependencyRegistry::from_settings(ResilienceSettings::from_toml_str(SETTINGS).unwrap())
            .unwrap()
    }

    #[test]
    fn test_same_name_shares_breaker() {
        let registry = registry();

        let a = registry.circuit_breaker("inventory").unwrap();
        let b = registry.circuit_breaker("inventory").unwrap();
        let other = registry.circuit_breaker("payments").unwrap();

        assert_eq!(a.config().failure_threshold, 2);
        assert_eq!(other.config().failure_threshold, 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(a.config(), b.config());
    }

    #[test]
    fn test_rate_limiter_only_when_configured() {
        let registry = registry();

        assert!(registry.rate_limiter("inventory").unwrap().is_none());
        let search = registry.rate_limiter("search").unwrap().unwrap();
        assert_eq!(search.config().max_requests, 2);

        assert!(search.try_acquire());
        let again = registry.rate_limiter("search").unwrap().unwrap();
        assert_eq!(again.current_count(), 1);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = ResilienceSettings::from_toml_str(
            "[dependencies.broken.circuit_breaker]\nfailure_threshold = 0\n",
        )
        .unwrap();
        assert!(DependencyRegistry::from_settings(settings).is_err());
    }

    #[tokio::test]
    async fn test_executor_shares_breaker_and_states() {
        let registry = registry();
        let executor = registry
            .executor("payments")
            .unwrap()
            .with_retry_config(crate::retry::RetryConfig::builder().max_retries(0).build().unwrap());

        let _ = executor.execute(|| async { Err::<(), _>(RemoteError::http(500, "down")) }).await;

        assert_eq!(registry.states().get("payments"), Some(&CircuitState::Open));
        assert_eq!(registry.open_circuits(), vec!["payments".to_string()]);

        registry.reset_all();
        assert_eq!(registry.circuit_breaker("payments").unwrap().get_state(), CircuitState::Closed);
        assert!(registry.open_circuits().is_empty());
    }

    #[test]
    fn test_register_and_remove() {
        let registry = DependencyRegistry::new();
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(9)
                .open_timeout(Duration::from_secs(1))
                .build()
                .unwrap(),
        )
        .unwrap();

        registry.register("ledger", breaker, None);
        assert_eq!(registry.circuit_breaker("ledger").unwrap().config().failure_threshold, 9);
        assert_eq!(registry.names(), vec!["ledger".to_string()]);

        assert!(registry.remove("ledger"));
        assert!(!registry.remove("ledger"));
        assert!(registry.is_empty());
    }
}
