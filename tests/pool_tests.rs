//! User pool behaviour under a paused tokio clock.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};

use swarm_loadtest::errors::{ConfigError, TransportError};
use swarm_loadtest::plan::YamlPlan;
use swarm_loadtest::pool::{RunConfig, UserPool};
use swarm_loadtest::scheduler::TagFilter;
use swarm_loadtest::stats::StatsAggregator;
use swarm_loadtest::transport::{Reply, Request, SharedTransport, Transport, TransportFactory};
use swarm_loadtest::user::WaitTime;

/// Answers 200 to everything and counts requests per path.
#[derive(Default)]
struct CountingTransport {
    requests: AtomicUsize,
    logouts: AtomicUsize,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn send(&self, request: &Request) -> Result<Reply, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if request.url.ends_with("/logout") {
            self.logouts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Reply::new(200, "{}", Duration::from_millis(2)))
    }
}

fn factory(transport: &Arc<CountingTransport>) -> Arc<dyn TransportFactory> {
    Arc::new(SharedTransport(transport.clone()))
}

const SERVICE_PLAN: &str = r#"
version: "1.0"
run:
  users: 20
  spawnRate: 4
  waitTime: 1s
userTypes:
  ProductServiceUser:
    host: http://localhost:8500
    weight: 3
    onStop:
      name: logout
      request: { method: POST, path: /logout }
    tasks:
      - name: get_all_products
        weight: 5
        tags: [product-service, read]
        request: { method: GET, path: /api/products }
      - name: create_product
        tags: [product-service, write]
        request: { method: POST, path: /api/products, json: '{"sku": "SKU-${random:1000:9999}"}' }
  OrderServiceUser:
    host: http://localhost:8300
    tasks:
      - name: get_all_orders
        tags: [order-service, read]
        request: { method: GET, path: /api/orders }
      - name: create_order
        tags: [order-service, write]
        request: { method: POST, path: /api/orders, json: '{}' }
"#;

fn service_plan_config() -> (YamlPlan, RunConfig) {
    let plan = YamlPlan::from_str(SERVICE_PLAN).unwrap();
    let mut config = RunConfig {
        seed: Some(7),
        ..RunConfig::default()
    };
    plan.apply_run_settings(&mut config).unwrap();
    (plan, config)
}

#[tokio::test(start_paused = true)]
async fn live_users_follow_spawn_rate() {
    let transport = Arc::new(CountingTransport::default());
    let (plan, config) = service_plan_config();

    let start = Instant::now();
    let handle = UserPool::start(
        &plan.to_test_plan().unwrap(),
        config,
        factory(&transport),
        StatsAggregator::new(),
    )
    .unwrap();

    // floor(4 * t), capped at 20
    for (at_ms, expected) in [(100, 0), (1_100, 4), (2_600, 10), (4_900, 19), (8_000, 20)] {
        time::sleep_until(start + Duration::from_millis(at_ms)).await;
        assert_eq!(handle.live_users(), expected, "live users at {}ms", at_ms);
    }

    handle.stop().await;
    assert_eq!(handle.live_users(), 0);

    let summaries = handle.summaries();
    let product_users = summaries
        .iter()
        .filter(|s| s.user_type == "ProductServiceUser")
        .count();
    assert_eq!(product_users, 15);
    assert_eq!(summaries.len() - product_users, 5);
}

#[tokio::test(start_paused = true)]
async fn concurrent_stops_run_teardown_once() {
    let transport = Arc::new(CountingTransport::default());
    let (plan, mut config) = service_plan_config();
    config.target_concurrency = 8;
    config.spawn_rate = 100.0;

    let handle = UserPool::start(
        &plan.to_test_plan().unwrap(),
        config,
        factory(&transport),
        StatsAggregator::new(),
    )
    .unwrap();
    time::sleep(Duration::from_secs(3)).await;

    let (a, b, c) = (handle.clone(), handle.clone(), handle.clone());
    tokio::join!(a.stop(), b.stop(), c.stop());
    handle.stop().await;

    assert!(handle.is_finished());
    assert_eq!(handle.live_users(), 0);
    // 8 users at 3:1 weights
    assert_eq!(transport.logouts.load(Ordering::SeqCst), 6);

    let snapshot = handle.aggregator().snapshot();
    assert_eq!(
        snapshot.entry("ProductServiceUser", "logout").unwrap().count,
        6
    );
    assert_eq!(
        snapshot.total.count as usize,
        transport.requests.load(Ordering::SeqCst)
    );
}

#[tokio::test(start_paused = true)]
async fn tag_filter_limits_tasks() {
    let transport = Arc::new(CountingTransport::default());
    let (plan, mut config) = service_plan_config();
    config.target_concurrency = 4;
    config.duration = Some(Duration::from_secs(30));
    config.tags = TagFilter::new(["read"], Vec::<String>::new());

    let handle = UserPool::start(
        &plan.to_test_plan().unwrap(),
        config,
        factory(&transport),
        StatsAggregator::new(),
    )
    .unwrap();
    handle.wait().await;

    let snapshot = handle.aggregator().snapshot();
    assert!(snapshot.action("get_all_products").unwrap().count > 0);
    assert!(snapshot.action("get_all_orders").unwrap().count > 0);
    assert!(snapshot.action("create_product").is_none());
    assert!(snapshot.action("create_order").is_none());
}

#[tokio::test]
async fn tag_filter_that_empties_a_user_type_is_rejected() {
    let transport = Arc::new(CountingTransport::default());
    let (plan, mut config) = service_plan_config();
    config.tags = TagFilter::new(["product-service"], Vec::<String>::new());

    let err = UserPool::start(
        &plan.to_test_plan().unwrap(),
        config,
        factory(&transport),
        StatsAggregator::new(),
    )
    .err()
    .unwrap();
    assert_eq!(
        err,
        ConfigError::NoEligibleActions("OrderServiceUser".to_string())
    );
    assert_eq!(transport.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn same_seed_same_task_sequence() {
    let mut counts = Vec::new();
    for _ in 0..2 {
        let transport = Arc::new(CountingTransport::default());
        let (plan, mut config) = service_plan_config();
        config.target_concurrency = 1;
        config.spawn_rate = 1_000.0;
        config.wait_time = WaitTime::constant(Duration::from_secs(1));
        config.duration = Some(Duration::from_millis(40_500));

        let handle = UserPool::start(
            &plan.to_test_plan().unwrap(),
            config,
            factory(&transport),
            StatsAggregator::new(),
        )
        .unwrap();
        handle.wait().await;

        let snapshot = handle.aggregator().snapshot();
        let per_action: Vec<(String, u64)> = snapshot
            .entries
            .iter()
            .map(|e| (e.name.clone(), e.count))
            .collect();
        counts.push(per_action);
    }

    assert_eq!(counts[0], counts[1]);
}
