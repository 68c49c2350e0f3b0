//! End-to-end reconciliation of F5 and shared entrypoints.

use vipsync_core::backend::PoolMember;
use vipsync_core::test_util::Harness;

fn names(entrypoints: &[&str]) -> Vec<String> {
    entrypoints.iter().map(|e| e.to_string()).collect()
}

// =============================================================================
// Owned entrypoints
// =============================================================================

#[tokio::test]
async fn test_create_builds_pool_before_virtual_server() {
    let lab = Harness::new();
    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["web"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());

    assert_eq!(lab.published("web").a, vec!["10.63.0.10"]);
    assert_eq!(
        lab.f5.mutations(),
        vec![
            "create_server lem01-t01-gpr01 10.61.1.11",
            "create_server lem01-t01-gpr02 10.61.1.12",
            "create_pool lem01-t01-gpr_80 lem01-t01-gpr01:80,lem01-t01-gpr02:80",
            "create_virtual web-lablemams_443 10.63.0.10",
        ]
    );
    assert!(lab.a10.mutations().is_empty());

    let vs = lab.f5.virtual_server("web-lablemams_443").unwrap();
    assert_eq!(vs.ports[0].pool.as_deref(), Some("lem01-t01-gpr_80"));
    assert!(vs.profiles.contains(&"xff".to_string()));
    assert!(vs.profiles.contains(&"star.example.net".to_string()));
    assert_eq!(lab.f5.pool("lem01-t01-gpr_80").unwrap().monitor, "tcp");
}

#[tokio::test]
async fn test_second_create_changes_nothing() {
    let lab = Harness::new();
    assert!(lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["web"]))
        .await
        .unwrap()
        .is_success());
    lab.clear_mutations();

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["web"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());
    assert!(lab.mutations().is_empty(), "unexpected: {:?}", lab.mutations());
}

#[tokio::test]
async fn test_member_drift_is_fixed_in_place() {
    let lab = Harness::new();
    assert!(lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["web"]))
        .await
        .unwrap()
        .is_success());
    lab.f5
        .seed_pool("lem01-t01-gpr_80", "tcp", &[PoolMember::new("lem01-t01-gpr01", 80)]);
    lab.clear_mutations();

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["web"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());

    let mutations = lab.f5.mutations();
    assert!(mutations.contains(&"add_member lem01-t01-gpr_80 lem01-t01-gpr02:80".to_string()));
    assert!(!mutations.iter().any(|m| m.starts_with("delete_")));
    assert_eq!(lab.f5.pool("lem01-t01-gpr_80").unwrap().members.len(), 2);
}

#[tokio::test]
async fn test_delete_removes_virtual_server_first() {
    let lab = Harness::new();
    assert!(lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["web"]))
        .await
        .unwrap()
        .is_success());
    lab.clear_mutations();

    let summary = lab.manager().await.unwrap().delete_entrypoints(&names(&["web"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());
    assert_eq!(
        lab.f5.mutations(),
        vec![
            "delete_virtual web-lablemams_443",
            "delete_pool lem01-t01-gpr_80",
            "delete_server lem01-t01-gpr01",
            "delete_server lem01-t01-gpr02",
        ]
    );
    assert!(lab.published("web").is_empty());
    assert!(lab.inventory.named("web").is_empty());
}

// =============================================================================
// Shared entrypoints
// =============================================================================

#[tokio::test]
async fn test_shared_entrypoint_publishes_cname_only() {
    let lab = Harness::new();
    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["service"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());

    let records = lab.published("service");
    assert_eq!(records.cname, vec!["service-sharedenv.example.net"]);
    assert!(records.a.is_empty());
    assert!(lab.f5.is_empty());
    assert!(lab.inventory.named("service").is_empty());

    let outcome = summary.runs[0].result.as_ref().unwrap();
    assert!(outcome.siblings.is_empty());
}

#[tokio::test]
async fn test_shared_entrypoint_is_idempotent() {
    let lab = Harness::new();
    assert!(lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["service"]))
        .await
        .unwrap()
        .is_success());
    lab.clear_mutations();

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["service"])).await.unwrap();
    assert!(summary.is_success());
    assert!(lab.mutations().is_empty(), "unexpected: {:?}", lab.mutations());
}

#[tokio::test]
async fn test_shared_entrypoint_delete_drops_cname() {
    let lab = Harness::new();
    assert!(lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["service"]))
        .await
        .unwrap()
        .is_success());

    let summary = lab.manager().await.unwrap().delete_entrypoints(&names(&["service"])).await.unwrap();
    assert!(summary.is_success());
    assert!(lab.published("service").is_empty());
}
