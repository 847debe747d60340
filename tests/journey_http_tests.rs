//! End-to-end runs against a mock HTTP server through the reqwest transport.

use std::sync::Arc;
use tokio::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use swarm_loadtest::client::{ClientConfig, ReqwestTransportFactory};
use swarm_loadtest::plan::YamlPlan;
use swarm_loadtest::pool::{RunConfig, RunHandle, UserPool};
use swarm_loadtest::stats::{StatsAggregator, StatsSnapshot};

const PURCHASE_PLAN: &str = r#"
version: "1.0"
run:
  users: 1
  spawnRate: 20
  duration: 1s
  waitTime: 10ms
  requestTimeout: 2s
userTypes:
  JourneyUser:
    host: MOCK_HOST
    journey:
      name: purchase
      steps:
        - name: register_user
          request: { method: POST, path: /api/users, json: '{"email": "user${random:1000:9999}@test.com"}' }
          extract:
            - { type: jsonPath, name: user_id, jsonPath: $.userId }
          expect: { status: [201] }
        - name: browse_products
          request: { method: GET, path: /api/products }
          expect: { status: [200] }
        - name: view_product_details
          optional: VIEW_OPTIONAL
          bind: { product_id: "${random:1:10}" }
          request: { method: GET, path: "/api/products/${product_id}" }
          expect: { status: [200, 404] }
        - name: create_order
          requires: [user_id, product_id]
          request: { method: POST, path: /api/orders, json: '{"orderDesc": "Order for user ${user_id}"}' }
          extract:
            - { type: jsonPath, name: order_id, jsonPath: $.orderId }
          expect: { status: [201] }
        - name: view_order
          requires: [order_id]
          request: { method: GET, path: "/api/orders/${order_id}" }
          expect: { status: [200] }
"#;

async fn run_plan(yaml: &str, host: &str) -> (RunHandle, StatsSnapshot) {
    let plan = YamlPlan::from_str(&yaml.replace("MOCK_HOST", host)).unwrap();
    let mut run_config = RunConfig::default();
    plan.apply_run_settings(&mut run_config).unwrap();

    let factory = ReqwestTransportFactory::new(ClientConfig::default()).unwrap();
    let handle = UserPool::start(
        &plan.to_test_plan().unwrap(),
        run_config,
        Arc::new(factory),
        StatsAggregator::new(),
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("run should end after its duration");
    let snapshot = handle.aggregator().snapshot();
    (handle, snapshot)
}

fn purchase_plan(view_optional: bool) -> String {
    PURCHASE_PLAN.replace("VIEW_OPTIONAL", &view_optional.to_string())
}

#[tokio::test]
async fn complete_journey_carries_ids_between_steps() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"userId": 7})))
        .expect(1..)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api/products/\d+$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/orders"))
        .and(body_string_contains("Order for user 7"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"orderId": 42})))
        .expect(1..)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/orders/42"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1..)
        .mount(&server)
        .await;

    let (handle, snapshot) = run_plan(&purchase_plan(false), &server.uri()).await;

    assert_eq!(snapshot.total.failure_count, 0, "{:?}", snapshot.failures);
    let purchase = snapshot.journey("purchase").unwrap();
    assert!(purchase.completed >= 1);
    assert_eq!(purchase.aborted, 0);
    assert!(snapshot.entry("JourneyUser", "view_order").unwrap().count >= 1);
    assert_eq!(handle.summaries().len(), 1);
}

#[tokio::test]
async fn failed_registration_aborts_before_browsing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1..)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (_handle, snapshot) = run_plan(&purchase_plan(false), &server.uri()).await;

    let purchase = snapshot.journey("purchase").unwrap();
    assert!(purchase.aborted >= 1);
    assert_eq!(purchase.completed, 0);
    assert!(snapshot.action("browse_products").is_none());
    assert!(snapshot
        .failures
        .iter()
        .any(|f| f.name == "register_user" && f.reason.contains("500")));
}

#[tokio::test]
async fn missing_product_id_skips_order_steps() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"userId": 7})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api/products/\d+$"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/orders"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let (_handle, snapshot) = run_plan(&purchase_plan(true), &server.uri()).await;

    let purchase = snapshot.journey("purchase").unwrap();
    assert!(purchase.completed >= 1);
    assert_eq!(purchase.aborted, 0);
    assert!(purchase.skipped_steps >= 2);
    assert!(snapshot.action("create_order").is_none());
    assert!(snapshot.action("view_order").is_none());
}

#[tokio::test]
async fn unparseable_registration_reply_is_an_extraction_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .mount(&server)
        .await;

    let (_handle, snapshot) = run_plan(&purchase_plan(false), &server.uri()).await;

    let register = snapshot.entry("JourneyUser", "register_user").unwrap();
    assert!(register.count >= 1);
    assert_eq!(register.failure_count, register.count);
    assert!(snapshot.failures.iter().any(|f| f
        .reason
        .contains("could not extract 'user_id' from response body")));
    assert_eq!(snapshot.journey("purchase").unwrap().completed, 0);
}

#[tokio::test]
async fn failing_target_fails_every_request_without_crashing_users() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let yaml = r#"
version: "1.0"
run: { users: 5, spawnRate: 50, duration: 1s, waitTime: 10ms }
userTypes:
  StressTestUser:
    host: MOCK_HOST
    tasks:
      - { name: rapid_fire_users, request: { method: GET, path: /api/users } }
      - { name: rapid_fire_products, request: { method: GET, path: /api/products } }
"#;
    let (handle, snapshot) = run_plan(yaml, &server.uri()).await;

    assert!(snapshot.total.count > 0);
    assert_eq!(snapshot.total.failure_count, snapshot.total.count);
    assert_eq!(snapshot.total.success_count, 0);

    let summaries = handle.summaries();
    assert_eq!(summaries.len(), 5);
    assert!(summaries.iter().all(|s| s.failures == s.requests));
}

#[tokio::test]
async fn session_cookie_from_on_start_is_kept_per_user() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "session=abc123; Path=/"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("cookie", "session=abc123"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let yaml = r#"
version: "1.0"
run: { users: 2, spawnRate: 20, duration: 1s, waitTime: 10ms }
userTypes:
  SessionUser:
    host: MOCK_HOST
    onStart:
      name: login
      request: { method: POST, path: /login }
    tasks:
      - { name: profile, request: { method: GET, path: /profile } }
"#;
    let (_handle, snapshot) = run_plan(yaml, &server.uri()).await;

    assert_eq!(snapshot.entry("SessionUser", "login").unwrap().count, 2);
    let profile = snapshot.entry("SessionUser", "profile").unwrap();
    assert!(profile.count >= 1);
    assert_eq!(profile.failure_count, 0);
}
