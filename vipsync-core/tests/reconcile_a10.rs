//! End-to-end reconciliation of A10 entrypoints against in-memory
//! collaborators.

use vipsync_core::backend::PoolMember;
use vipsync_core::test_util::Harness;
use vipsync_core::{Action, Error};

fn names(entrypoints: &[&str]) -> Vec<String> {
    entrypoints.iter().map(|e| e.to_string()).collect()
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_builds_whole_tree() {
    let lab = Harness::new();
    let mut manager = lab.manager().await.unwrap();

    let summary = manager.create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());

    assert_eq!(lab.published("api").a, vec!["10.62.0.10"]);
    let reserved = lab.inventory.named("api");
    assert_eq!(reserved.len(), 2);
    assert!(reserved.iter().all(|i| i.ip == "10.62.0.10"));

    assert_eq!(
        lab.a10.mutations(),
        vec![
            "create_virtual api-lablemams 10.62.0.10",
            "create_server lem01-t01-pwr01 10.61.0.11",
            "create_server lem01-t01-pwr02 10.61.0.12",
            "create_pool lem01-t01-pwr_80 lem01-t01-pwr01:80,lem01-t01-pwr02:80",
            "create_port api-lablemams 443+https lem01-t01-pwr_80",
        ]
    );
    assert_eq!(lab.a10.pool("lem01-t01-pwr_80").unwrap().monitor, "http_pwr");
}

#[tokio::test]
async fn test_second_create_changes_nothing() {
    let lab = Harness::new();
    let first = lab.manager().await.unwrap().create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(first.is_success());
    lab.clear_mutations();

    let second = lab.manager().await.unwrap().create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(second.is_success(), "failed: {:?}", second.failed());
    assert!(lab.mutations().is_empty(), "unexpected: {:?}", lab.mutations());

    let diff = lab.manager().await.unwrap().global_diff("pwr").await.unwrap();
    let api = &diff.siblings.iter().find(|(name, _)| name == "api-lablemams").unwrap().1;
    assert_eq!(api.body, serde_json::json!({}));
}

#[tokio::test]
async fn test_entrypoints_of_one_service_share_the_pool() {
    let lab = Harness::new();
    let summary = lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["api", "intapi"]))
        .await
        .unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());

    assert_eq!(lab.published("intapi").a, vec!["10.62.0.11"]);
    assert_eq!(lab.a10.pool_names(), vec!["lem01-t01-pwr_80"]);
    assert!(lab.a10.virtual_port("intapi-lablemams", 80, "http").is_some());
    assert_eq!(
        lab.a10.mutations().iter().filter(|m| m.starts_with("create_pool")).count(),
        1
    );
}

#[tokio::test]
async fn test_unpublished_address_is_reserved_again() {
    // Intentional: an unreserved plan next to a published address goes
    // straight to create, the record is never deleted first.
    let lab = Harness::new();
    lab.dns.seed(
        vipsync_core::services::RecordType::A,
        "api-lablemams.example.net",
        "10.62.0.42",
    );

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());

    // the stale record is not offered back to the inventory
    let reservations = lab.inventory.reservations();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].previous_ip, None);

    assert_eq!(lab.published("api").a, vec!["10.62.0.10"]);
    assert!(lab.inventory.named("api").iter().all(|i| i.ip == "10.62.0.10"));
    assert!(!lab.dns.mutations().iter().any(|m| m.starts_with("delete")));
    assert_eq!(lab.a10.virtual_server("api-lablemams").unwrap().address, "10.62.0.10");
}

#[tokio::test]
async fn test_reserved_address_is_used_before_it_resolves() {
    let lab = Harness::new();
    let mut manager = lab.manager_with_stale_dns(&["api"]).await.unwrap();

    let summary = manager.create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());

    let outcome = summary.runs[0].result.as_ref().unwrap();
    assert_eq!(outcome.siblings.len(), 1);
    assert!(outcome.is_success());
    assert_eq!(lab.published("api").a, vec!["10.62.0.10"]);
    assert_eq!(lab.a10.virtual_server("api-lablemams").unwrap().address, "10.62.0.10");
    assert!(lab.a10.virtual_port("api-lablemams", 443, "https").is_some());
    assert!(lab.a10.pool("lem01-t01-pwr_80").is_some());
}

#[tokio::test]
async fn test_refused_reservation_fails_the_entrypoint() {
    let lab = Harness::new();
    lab.inventory.refuse_reservations(true);

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(!summary.is_success());
    assert_eq!(summary.failed(), vec!["api"]);
    assert!(lab.a10.is_empty());
}

// =============================================================================
// Conflicts
// =============================================================================

#[tokio::test]
async fn test_server_holding_the_address_is_replaced() {
    let lab = Harness::new();
    lab.a10.seed_server("nodeB", "10.61.0.11");

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());

    assert!(lab.a10.server("nodeB").is_none());
    assert_eq!(lab.a10.server("lem01-t01-pwr01").unwrap().address, "10.61.0.11");
}

#[tokio::test]
async fn test_referenced_address_owner_blocks_the_pool() {
    let lab = Harness::new();
    lab.a10.seed_server("nodeB", "10.61.0.11");
    lab.a10.seed_pool("legacy_80", "tcp", &[PoolMember::new("nodeB", 80)]);

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(!summary.is_success());

    assert!(lab.a10.server("nodeB").is_some());
    assert!(lab.a10.pool("lem01-t01-pwr_80").is_none());
    assert!(lab.a10.virtual_port("api-lablemams", 443, "https").is_none());

    let outcome = summary.runs[0].result.as_ref().unwrap();
    assert!(outcome.ok);
    assert!(outcome
        .failures()
        .iter()
        .any(|path| path.ends_with("lem01-t01-pwr_80/lem01-t01-pwr01")));
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn test_delete_tears_everything_down() {
    let lab = Harness::new();
    assert!(lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["api"]))
        .await
        .unwrap()
        .is_success());

    let summary = lab.manager().await.unwrap().delete_entrypoints(&names(&["api"])).await.unwrap();
    assert_eq!(summary.action, Action::Delete);
    assert!(summary.is_success(), "failed: {:?}", summary.failed());
    assert!(summary.runs[0].result.as_ref().unwrap().is_success());

    assert!(lab.a10.is_empty(), "left behind: {:?}", lab.a10.virtual_names());
    assert!(lab.published("api").is_empty());
    assert!(lab.inventory.named("api").is_empty());
}

#[tokio::test]
async fn test_delete_keeps_pool_used_by_another_entrypoint() {
    let lab = Harness::new();
    assert!(lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["api", "intapi"]))
        .await
        .unwrap()
        .is_success());
    lab.clear_mutations();

    let summary = lab.manager().await.unwrap().delete_entrypoints(&names(&["api"])).await.unwrap();
    // the entrypoint itself is gone, the shared pool is only reported
    assert!(summary.is_success());
    assert!(!summary.runs[0].result.as_ref().unwrap().is_success());

    assert!(lab.a10.virtual_server("api-lablemams").is_none());
    assert!(lab.a10.pool("lem01-t01-pwr_80").is_some());
    assert!(lab.a10.server("lem01-t01-pwr01").is_some());
    assert!(!lab.a10.mutations().iter().any(|m| m.starts_with("delete_pool")));
}

#[tokio::test]
async fn test_delete_of_absent_entrypoint_succeeds() {
    let lab = Harness::new();
    let summary = lab.manager().await.unwrap().delete_entrypoints(&names(&["api"])).await.unwrap();
    assert!(summary.is_success());
    assert!(lab.mutations().is_empty());
}

// =============================================================================
// Variables
// =============================================================================

#[tokio::test]
async fn test_stale_variable_is_reset() {
    let lab = Harness::new();
    lab.environment.set("PWR_API_HOST", "api-otherenv.example.net");

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(summary.is_success());
    assert_eq!(lab.environment.assignments(), vec!["PWR_API_HOST="]);
    assert_eq!(lab.environment.variable("PWR_API_HOST").as_deref(), Some(""));
}

#[tokio::test]
async fn test_matching_variable_is_left_alone() {
    let lab = Harness::new();
    lab.environment.fail_variable_reads(1);

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(summary.is_success());
    assert!(lab.environment.assignments().is_empty());
}

// =============================================================================
// Inspection
// =============================================================================

#[tokio::test]
async fn test_describe_vip_lists_members() {
    let lab = Harness::new();
    let mut manager = lab.manager().await.unwrap();
    assert!(manager.describe_vip("api").await.unwrap().is_empty());
    assert!(manager.create_entrypoints(&names(&["api"])).await.unwrap().is_success());

    let vips = manager.describe_vip("api").await.unwrap();
    assert_eq!(vips.len(), 1);
    assert_eq!(vips[0].name, "api-lablemams");
    assert_eq!(vips[0].address, "10.62.0.10");
    let pool = vips[0].ports[0].pool.as_ref().unwrap();
    assert_eq!(pool.name, "lem01-t01-pwr_80");
    assert_eq!(pool.members.len(), 2);
    assert_eq!(pool.members[0].address.as_deref(), Some("10.61.0.11"));
}

#[tokio::test]
async fn test_group_plan_lists_every_entrypoint() {
    let lab = Harness::new();
    let plan = lab.manager().await.unwrap().global_plan("pwr").await.unwrap();

    assert_eq!(plan.kind, "EntrypointGroup");
    assert_eq!(plan.is_valid, Some(true));
    let names: Vec<&str> = plan.siblings.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["api-lablemams", "intapi-lablemams"]);
    assert_eq!(
        plan.siblings[0].1.body["dns"]["ips"]["A"],
        serde_json::json!(["Need to reserve IP"])
    );
    assert!(lab.mutations().is_empty());
}

// =============================================================================
// Fatal errors
// =============================================================================

#[tokio::test]
async fn test_unknown_environment_is_fatal() {
    let lab = Harness::with_environment(vipsync_core::test_util::FakeEnvironment::unknown());
    assert!(matches!(lab.manager().await, Err(Error::UnknownEnvironment(_))));
}

#[tokio::test]
async fn test_missing_balancer_family_aborts_the_run() {
    let lab = Harness::new();
    let balancers = vipsync_core::Balancers::new("AMS02").with(lab.a10.clone());
    let mut manager = lab.manager_with(balancers, lab.options()).await.unwrap();

    let result = manager.create_entrypoints(&names(&["web", "api"])).await;
    assert!(matches!(result, Err(Error::NoBalancerMapping { .. })));
    assert!(lab.mutations().is_empty());
    assert!(lab.inventory.named("web").is_empty());
}

#[tokio::test]
async fn test_entrypoint_without_service_aborts_the_run() {
    let lab = Harness::new();
    let result = lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["ghost", "api"]))
        .await;

    assert!(matches!(result, Err(Error::NoOwningService(name)) if name == "ghost"));
    assert!(lab.mutations().is_empty());
}
