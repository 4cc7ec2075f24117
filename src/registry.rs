//! Service registry & router (§4.4): registration, health tracking, load
//! balancing, traffic splitting. Keyed counters follow the `DashMap`-per-key
//! pattern in
//! `other_examples/338197b2_snakewayhq-snakeway__...traffic_management-manager.rs`
//! (`active_requests`, `total_requests`, the smooth weighted-round-robin
//! accumulator); that file's per-upstream `HealthState` with
//! `consecutive_failures` + cooldown is generalized here into the four-way
//! healthy/degraded/unhealthy/maintenance status the data model calls for.

use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RESPONSE_TIME_EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Maintenance,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthStatus {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub response_time_ewma: f64,
    pub last_check_at_millis: u64,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self { state: HealthState::Healthy, consecutive_failures: 0, response_time_ewma: 0.0, last_check_at_millis: 0 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadBalancingState {
    pub current_connections: i64,
    pub weight: u32,
    pub last_selected_at_millis: u64,
    pub total_requests: u64,
    pub failure_rate_ewma: f64,
}

impl Default for LoadBalancingState {
    fn default() -> Self {
        Self { current_connections: 0, weight: 1, last_selected_at_millis: 0, total_requests: 0, failure_rate_ewma: 0.0 }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { enabled: false, path: "/health".into(), interval: Duration::from_secs(10), timeout: Duration::from_secs(2) }
    }
}

/// A registered service instance (the Data Model's Service Record).
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub endpoints: Vec<String>,
    pub weight: u32,
    pub metadata: std::collections::HashMap<String, String>,
    pub tags: Vec<String>,
    pub health_check: HealthCheckConfig,
    pub created_at_millis: u64,
    pub last_seen_millis: u64,
}

/// Patch applied by `update`; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ServicePatch {
    pub version: Option<String>,
    pub endpoints: Option<Vec<String>>,
    pub weight: Option<u32>,
    pub metadata: Option<std::collections::HashMap<String, String>>,
    pub tags: Option<Vec<String>>,
}

/// The five load-balancing strategies (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    IpHash,
    LeastResponseTime,
}

/// Per-selection request context.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_id: Option<String>,
}

/// One traffic-split rule: route `weight` percent of traffic (cumulative,
/// out of 100) to instances matching `selector_tag`.
#[derive(Debug, Clone)]
pub struct TrafficSplitRule {
    pub weight: u8,
    pub selector_tag: Option<String>,
}

struct ServiceEntry {
    record: ServiceRecord,
    health: HealthStatus,
    lb: LoadBalancingState,
}

/// Smooth weighted round-robin accumulator, one per service name, reset
/// whenever the candidate set or weights change between calls.
struct WrrState {
    current_weights: Vec<i64>,
    instance_ids: Vec<String>,
    total_weight: i64,
}

pub struct ServiceRegistry {
    instances: DashMap<String, ServiceEntry>,
    by_name: DashMap<String, Vec<String>>,
    wrr_state: DashMap<String, Mutex<WrrState>>,
    traffic_splits: DashMap<String, Vec<TrafficSplitRule>>,
    breaker_open: DashMap<String, bool>,
    clock: Arc<dyn Clock>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            instances: DashMap::new(),
            by_name: DashMap::new(),
            wrr_state: DashMap::new(),
            traffic_splits: DashMap::new(),
            breaker_open: DashMap::new(),
            clock,
        }
    }

    pub fn register(&self, record: ServiceRecord) -> Result<(), Error> {
        if self.instances.contains_key(&record.id) {
            return Err(Error::already_exists(format!("service instance '{}' already registered", record.id)));
        }
        let name = record.name.clone();
        let weight = record.weight.max(1);
        self.by_name.entry(name).or_default().push(record.id.clone());
        self.instances.insert(
            record.id.clone(),
            ServiceEntry {
                record,
                health: HealthStatus::default(),
                lb: LoadBalancingState { weight, ..Default::default() },
            },
        );
        Ok(())
    }

    pub fn deregister(&self, id: &str) -> Result<(), Error> {
        let Some((_, entry)) = self.instances.remove(id) else {
            return Err(Error::not_found(format!("service instance '{id}' not found")));
        };
        if let Some(mut ids) = self.by_name.get_mut(&entry.record.name) {
            ids.retain(|x| x != id);
        }
        Ok(())
    }

    pub fn update(&self, id: &str, patch: ServicePatch) -> Result<(), Error> {
        let mut entry = self.instances.get_mut(id).ok_or_else(|| Error::not_found(format!("service instance '{id}' not found")))?;
        if let Some(version) = patch.version {
            entry.record.version = version;
        }
        if let Some(endpoints) = patch.endpoints {
            entry.record.endpoints = endpoints;
        }
        if let Some(weight) = patch.weight {
            entry.record.weight = weight;
            entry.lb.weight = weight.max(1);
        }
        if let Some(metadata) = patch.metadata {
            entry.record.metadata = metadata;
        }
        if let Some(tags) = patch.tags {
            entry.record.tags = tags;
        }
        entry.record.last_seen_millis = self.clock.now_millis();
        Ok(())
    }

    pub fn set_health(&self, id: &str, state: HealthState) -> Result<(), Error> {
        let mut entry = self.instances.get_mut(id).ok_or_else(|| Error::not_found(format!("service instance '{id}' not found")))?;
        entry.health.state = state;
        entry.health.last_check_at_millis = self.clock.now_millis();
        if state == HealthState::Healthy {
            entry.health.consecutive_failures = 0;
        }
        Ok(())
    }

    /// Marks a breaker attached to this instance (by breaker key) open or
    /// closed; `discover` excludes instances whose attached breaker is open.
    pub fn set_breaker_open(&self, breaker_key: &str, open: bool) {
        self.breaker_open.insert(breaker_key.to_string(), open);
    }

    fn is_breaker_open(&self, id: &str) -> bool {
        self.breaker_open.get(id).map(|v| *v).unwrap_or(false)
    }

    /// Health checks report failure/success inline; this drives the state
    /// machine the same way `§4.4 Health checking` describes for scheduled
    /// probes: consecutive failures beyond the threshold mark unhealthy, a
    /// slow-but-successful response marks degraded, a success after
    /// unhealthy clears the counter and marks healthy.
    pub fn report_health_check(&self, id: &str, success: bool, response_time: Duration, failure_threshold: u32, timeout: Duration) -> Result<(), Error> {
        let mut entry = self.instances.get_mut(id).ok_or_else(|| Error::not_found(format!("service instance '{id}' not found")))?;
        entry.health.last_check_at_millis = self.clock.now_millis();
        if entry.health.state == HealthState::Maintenance {
            return Ok(());
        }

        if !success {
            entry.health.consecutive_failures += 1;
            if entry.health.consecutive_failures >= failure_threshold {
                entry.health.state = HealthState::Unhealthy;
            }
            return Ok(());
        }

        entry.health.consecutive_failures = 0;
        let threshold = timeout.mul_f64(0.8);
        entry.health.state = if response_time > threshold { HealthState::Degraded } else { HealthState::Healthy };
        Ok(())
    }

    /// `recordOutcome(id, success, responseTimeMs)`: updates response-time
    /// EWMA and failure-rate EWMA, and increments the consecutive-failure
    /// counter the same way a failed health check would.
    pub fn record_outcome(&self, id: &str, success: bool, response_time: Duration) -> Result<(), Error> {
        let mut entry = self.instances.get_mut(id).ok_or_else(|| Error::not_found(format!("service instance '{id}' not found")))?;
        let sample = response_time.as_secs_f64() * 1000.0;
        entry.health.response_time_ewma = update_ewma(entry.health.response_time_ewma, sample);
        let failure_sample = if success { 0.0 } else { 1.0 };
        entry.lb.failure_rate_ewma = update_ewma(entry.lb.failure_rate_ewma, failure_sample);
        entry.lb.total_requests += 1;
        if success {
            entry.health.consecutive_failures = 0;
            if entry.health.state == HealthState::Unhealthy {
                entry.health.state = HealthState::Healthy;
            }
        } else {
            entry.health.consecutive_failures += 1;
        }
        Ok(())
    }

    pub fn on_request_start(&self, id: &str) {
        if let Some(mut entry) = self.instances.get_mut(id) {
            entry.lb.current_connections += 1;
        }
    }

    pub fn on_request_end(&self, id: &str) {
        if let Some(mut entry) = self.instances.get_mut(id) {
            entry.lb.current_connections = (entry.lb.current_connections - 1).max(0);
        }
    }

    /// Instances whose status ∈ {healthy, degraded} and whose attached
    /// breaker (if any) is not open.
    pub fn discover(&self, name: &str) -> Vec<ServiceRecord> {
        let Some(ids) = self.by_name.get(name) else { return Vec::new() };
        ids.iter()
            .filter_map(|id| self.instances.get(id))
            .filter(|entry| matches!(entry.health.state, HealthState::Healthy | HealthState::Degraded))
            .filter(|entry| !self.is_breaker_open(&entry.record.id))
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn configure_traffic_split(&self, name: &str, rules: Vec<TrafficSplitRule>) {
        self.traffic_splits.insert(name.to_string(), rules);
    }

    /// Samples a uniform draw in `[0, 100)` against the configured rules'
    /// cumulative weights, filters candidates by the winning rule's
    /// selector tag, and falls back to the unfiltered set if that leaves
    /// nothing (fail open). No-op if no rules are configured for `name`.
    pub fn apply_traffic_split(&self, name: &str, candidates: Vec<ServiceRecord>) -> Vec<ServiceRecord> {
        let Some(rules) = self.traffic_splits.get(name) else { return candidates };
        if rules.is_empty() {
            return candidates;
        }

        let sample = rand::random::<f64>() * 100.0;
        let mut cumulative = 0u32;
        let mut chosen: Option<&TrafficSplitRule> = None;
        for rule in rules.iter() {
            cumulative += rule.weight as u32;
            if sample < cumulative as f64 {
                chosen = Some(rule);
                break;
            }
        }

        let Some(rule) = chosen else { return candidates };
        let Some(tag) = &rule.selector_tag else { return candidates };

        let filtered: Vec<ServiceRecord> = candidates.iter().filter(|c| c.tags.iter().any(|t| t == tag)).cloned().collect();
        if filtered.is_empty() {
            candidates
        } else {
            filtered
        }
    }

    pub fn select_instance(&self, name: &str, candidates: &[ServiceRecord], strategy: LoadBalancingStrategy, ctx: Option<&RequestContext>) -> Result<ServiceRecord, Error> {
        if candidates.is_empty() {
            return Err(Error::no_healthy_instances(format!("no healthy instances for service '{name}'")));
        }

        let chosen = match strategy {
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(candidates),
            LoadBalancingStrategy::LeastConnections => self.select_least_connections(candidates),
            LoadBalancingStrategy::WeightedRoundRobin => self.select_weighted_round_robin(name, candidates),
            LoadBalancingStrategy::IpHash => self.select_ip_hash(candidates, ctx),
            LoadBalancingStrategy::LeastResponseTime => self.select_least_response_time(candidates),
        };
        Ok(chosen)
    }

    fn select_round_robin(&self, candidates: &[ServiceRecord]) -> ServiceRecord {
        let winner = candidates
            .iter()
            .min_by_key(|c| self.instances.get(&c.id).map(|e| e.lb.last_selected_at_millis).unwrap_or(0))
            .expect("non-empty candidates")
            .clone();
        if let Some(mut entry) = self.instances.get_mut(&winner.id) {
            entry.lb.last_selected_at_millis = self.clock.now_millis();
        }
        winner
    }

    fn select_least_connections(&self, candidates: &[ServiceRecord]) -> ServiceRecord {
        candidates
            .iter()
            .min_by_key(|c| {
                let e = self.instances.get(&c.id);
                let connections = e.as_ref().map(|e| e.lb.current_connections).unwrap_or(0);
                let last_selected = e.as_ref().map(|e| e.lb.last_selected_at_millis).unwrap_or(0);
                (connections, last_selected)
            })
            .expect("non-empty candidates")
            .clone()
    }

    fn select_weighted_round_robin(&self, name: &str, candidates: &[ServiceRecord]) -> ServiceRecord {
        let instance_ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let total_weight: i64 = candidates.iter().map(|c| c.weight.max(1) as i64).sum();

        let lock = self.wrr_state.entry(name.to_string()).or_insert_with(|| {
            Mutex::new(WrrState { current_weights: vec![0; candidates.len()], instance_ids: instance_ids.clone(), total_weight })
        });
        let mut state = lock.lock().expect("wrr state mutex poisoned");

        if state.instance_ids.len() != instance_ids.len() || state.instance_ids != instance_ids || state.total_weight != total_weight {
            state.current_weights = vec![0; candidates.len()];
            state.instance_ids = instance_ids;
            state.total_weight = total_weight;
        }

        let mut best_idx = 0usize;
        let mut best_val = i64::MIN;
        for (i, c) in candidates.iter().enumerate() {
            state.current_weights[i] += c.weight.max(1) as i64;
            if state.current_weights[i] > best_val {
                best_val = state.current_weights[i];
                best_idx = i;
            }
        }
        state.current_weights[best_idx] -= state.total_weight;
        candidates[best_idx].clone()
    }

    fn select_ip_hash(&self, candidates: &[ServiceRecord], ctx: Option<&RequestContext>) -> ServiceRecord {
        let mut sorted: Vec<&ServiceRecord> = candidates.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        let client_id = ctx.and_then(|c| c.client_id.as_deref()).unwrap_or("");
        let mut hasher = DefaultHasher::new();
        client_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % sorted.len();
        sorted[idx].clone()
    }

    fn select_least_response_time(&self, candidates: &[ServiceRecord]) -> ServiceRecord {
        candidates
            .iter()
            .min_by(|a, b| {
                let ra = self.instances.get(&a.id).map(|e| e.health.response_time_ewma).unwrap_or(0.0);
                let rb = self.instances.get(&b.id).map(|e| e.health.response_time_ewma).unwrap_or(0.0);
                ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("non-empty candidates")
            .clone()
    }

    pub fn health_status(&self, id: &str) -> Option<HealthStatus> {
        self.instances.get(id).map(|e| e.health)
    }

    pub fn load_balancing_state(&self, id: &str) -> Option<LoadBalancingState> {
        self.instances.get(id).map(|e| e.lb)
    }
}

fn update_ewma(previous: f64, sample: f64) -> f64 {
    if previous == 0.0 {
        sample
    } else {
        RESPONSE_TIME_EWMA_ALPHA * sample + (1.0 - RESPONSE_TIME_EWMA_ALPHA) * previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashMap;

    fn record(id: &str, name: &str, weight: u32, tags: &[&str]) -> ServiceRecord {
        ServiceRecord {
            id: id.to_string(),
            name: name.to_string(),
            version: "v1".to_string(),
            endpoints: vec![format!("http://{id}")],
            weight,
            metadata: HashMap::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            health_check: HealthCheckConfig::default(),
            created_at_millis: 0,
            last_seen_millis: 0,
        }
    }

    #[test]
    fn register_then_discover_returns_healthy_instance() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &[])).unwrap();
        let found = registry.discover("svc");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[test]
    fn duplicate_register_is_already_exists() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &[])).unwrap();
        assert!(registry.register(record("a", "svc", 1, &[])).unwrap_err().is_already_exists());
    }

    #[test]
    fn health_monotonicity_unhealthy_excluded_from_discover() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &[])).unwrap();
        for _ in 0..3 {
            registry.report_health_check("a", false, Duration::from_millis(10), 3, Duration::from_secs(1)).unwrap();
        }
        assert!(registry.discover("svc").is_empty());
    }

    #[test]
    fn maintenance_records_are_never_marked_unhealthy_by_checks() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &[])).unwrap();
        registry.set_health("a", HealthState::Maintenance).unwrap();
        registry.report_health_check("a", false, Duration::from_millis(10), 1, Duration::from_secs(1)).unwrap();
        assert_eq!(registry.health_status("a").unwrap().state, HealthState::Maintenance);
    }

    #[test]
    fn slow_success_marks_degraded() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &[])).unwrap();
        registry.report_health_check("a", true, Duration::from_millis(900), 3, Duration::from_secs(1)).unwrap();
        assert_eq!(registry.health_status("a").unwrap().state, HealthState::Degraded);
        assert!(registry.discover("svc").iter().any(|r| r.id == "a"));
    }

    #[test]
    fn round_robin_picks_earliest_last_selected() {
        let clock = ManualClock::new();
        let registry = ServiceRegistry::with_clock(Arc::new(clock.clone()));
        registry.register(record("a", "svc", 1, &[])).unwrap();
        registry.register(record("b", "svc", 1, &[])).unwrap();

        let candidates = registry.discover("svc");
        let first = registry.select_instance("svc", &candidates, LoadBalancingStrategy::RoundRobin, None).unwrap();
        clock.advance(1);
        let candidates = registry.discover("svc");
        let second = registry.select_instance("svc", &candidates, LoadBalancingStrategy::RoundRobin, None).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn least_connections_prefers_idle_instance() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &[])).unwrap();
        registry.register(record("b", "svc", 1, &[])).unwrap();
        registry.on_request_start("a");
        registry.on_request_start("a");

        let candidates = registry.discover("svc");
        let chosen = registry.select_instance("svc", &candidates, LoadBalancingStrategy::LeastConnections, None).unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[test]
    fn weighted_round_robin_respects_weight_ratio() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 3, &[])).unwrap();
        registry.register(record("b", "svc", 1, &[])).unwrap();

        let mut counts = HashMap::new();
        for _ in 0..8 {
            let candidates = registry.discover("svc");
            let chosen = registry.select_instance("svc", &candidates, LoadBalancingStrategy::WeightedRoundRobin, None).unwrap();
            *counts.entry(chosen.id).or_insert(0) += 1;
        }
        assert_eq!(*counts.get("a").unwrap_or(&0), 6);
        assert_eq!(*counts.get("b").unwrap_or(&0), 2);
    }

    #[test]
    fn ip_hash_is_stable_for_the_same_client() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &[])).unwrap();
        registry.register(record("b", "svc", 1, &[])).unwrap();
        let ctx = RequestContext { client_id: Some("client-1".to_string()) };

        let candidates = registry.discover("svc");
        let first = registry.select_instance("svc", &candidates, LoadBalancingStrategy::IpHash, Some(&ctx)).unwrap();
        let second = registry.select_instance("svc", &candidates, LoadBalancingStrategy::IpHash, Some(&ctx)).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn least_response_time_prefers_faster_instance() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &[])).unwrap();
        registry.register(record("b", "svc", 1, &[])).unwrap();
        registry.record_outcome("a", true, Duration::from_millis(500)).unwrap();
        registry.record_outcome("b", true, Duration::from_millis(10)).unwrap();

        let candidates = registry.discover("svc");
        let chosen = registry.select_instance("svc", &candidates, LoadBalancingStrategy::LeastResponseTime, None).unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[test]
    fn traffic_split_filters_by_selector_and_fails_open_when_empty() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &["canary"])).unwrap();
        registry.register(record("b", "svc", 1, &["stable"])).unwrap();
        registry.configure_traffic_split("svc", vec![TrafficSplitRule { weight: 100, selector_tag: Some("nonexistent".to_string()) }]);

        let candidates = registry.discover("svc");
        let split = registry.apply_traffic_split("svc", candidates.clone());
        assert_eq!(split.len(), candidates.len());
    }

    #[test]
    fn discover_excludes_instances_with_open_breaker() {
        let registry = ServiceRegistry::new();
        registry.register(record("a", "svc", 1, &[])).unwrap();
        registry.set_breaker_open("a", true);
        assert!(registry.discover("svc").is_empty());
    }

    #[test]
    fn select_instance_on_empty_candidates_is_no_healthy_instances() {
        let registry = ServiceRegistry::new();
        let err = registry.select_instance("svc", &[], LoadBalancingStrategy::RoundRobin, None).unwrap_err();
        assert!(err.is_no_healthy_instances());
    }
}
