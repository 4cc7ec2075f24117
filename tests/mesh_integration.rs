use meshline::{
    CircuitBreakerConfig, CircuitBreakerManager, Error, FacadeConfig, HealthCheckConfig,
    OrchestrationFacade, RouteRequest, ServiceRecord, ServiceRegistry,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn record(id: &str, name: &str, weight: u32) -> ServiceRecord {
    ServiceRecord {
        id: id.to_string(),
        name: name.to_string(),
        version: "v1".to_string(),
        endpoints: vec![format!("http://{id}")],
        weight,
        metadata: HashMap::new(),
        tags: vec![],
        health_check: HealthCheckConfig::default(),
        created_at_millis: 0,
        last_seen_millis: 0,
    }
}

#[tokio::test]
async fn route_round_robins_across_registered_instances() {
    let registry = Arc::new(ServiceRegistry::new());
    registry.register(record("a", "svc", 1)).unwrap();
    registry.register(record("b", "svc", 1)).unwrap();
    let breakers = Arc::new(CircuitBreakerManager::new());
    let facade = OrchestrationFacade::new(registry, breakers, FacadeConfig::default());

    let request = RouteRequest { service: "svc".into(), ..Default::default() };
    let mut seen = Vec::new();
    for _ in 0..4 {
        let id = facade.route(&request, |instance| async move { Ok::<_, Error>(instance.id) }).await.unwrap();
        seen.push(id);
    }

    assert_eq!(seen, vec!["a", "b", "a", "b"]);
}

#[tokio::test]
async fn repeated_failures_open_the_breaker_and_fallback_keeps_routing_elsewhere() {
    let registry = Arc::new(ServiceRegistry::new());
    registry.register(record("a", "svc", 1)).unwrap();
    registry.register(record("b", "svc", 1)).unwrap();
    let breakers = Arc::new(CircuitBreakerManager::new());
    let config = FacadeConfig {
        max_retries: 1,
        breaker_defaults: CircuitBreakerConfig::builder().failure_threshold(2).build(),
        ..FacadeConfig::default()
    };
    let facade = OrchestrationFacade::new(registry.clone(), breakers, config);

    let calls: Arc<std::sync::Mutex<HashMap<String, usize>>> = Arc::new(std::sync::Mutex::new(HashMap::new()));

    // Drive instance "a" to open its breaker directly, outside the facade,
    // so the next routed call is guaranteed to see it excluded.
    for _ in 0..2 {
        let request = RouteRequest { service: "svc".into(), ..Default::default() };
        let calls = calls.clone();
        let _ = facade
            .route(&request, move |instance| {
                let calls = calls.clone();
                async move {
                    let mut guard = calls.lock().unwrap();
                    let n = guard.entry(instance.id.clone()).or_insert(0);
                    *n += 1;
                    if instance.id == "a" {
                        Err(Error::unavailable("a is down"))
                    } else {
                        Ok(instance.id)
                    }
                }
            })
            .await;
    }

    // "a" should be excluded from discovery now that its breaker tripped.
    let remaining: Vec<_> = registry.discover("svc").into_iter().map(|r| r.id).collect();
    assert_eq!(remaining, vec!["b".to_string()]);
}

#[tokio::test]
async fn unhealthy_instance_is_excluded_then_recovers() {
    let registry = Arc::new(ServiceRegistry::new());
    registry.register(record("a", "svc", 1)).unwrap();
    registry.register(record("b", "svc", 1)).unwrap();

    use meshline::HealthState;
    registry.set_health("a", HealthState::Unhealthy).unwrap();

    let breakers = Arc::new(CircuitBreakerManager::new());
    let facade = OrchestrationFacade::new(registry.clone(), breakers, FacadeConfig::default());

    let request = RouteRequest { service: "svc".into(), ..Default::default() };
    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let calls = calls.clone();
        let id = facade
            .route(&request, move |instance| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Error>(instance.id) }
            })
            .await
            .unwrap();
        assert_eq!(id, "b");
    }

    registry.set_health("a", HealthState::Healthy).unwrap();
    let candidates: Vec<_> = registry.discover("svc").into_iter().map(|r| r.id).collect();
    assert!(candidates.contains(&"a".to_string()));
}
