//! Run-level behavior: group validation, cleaning, reports and selection.

use serde_json::json;
use vipsync_core::services::RecordType;
use vipsync_core::test_util::Harness;
use vipsync_core::{Error, ManagerOptions};

fn names(entrypoints: &[&str]) -> Vec<String> {
    entrypoints.iter().map(|e| e.to_string()).collect()
}

// =============================================================================
// Entrypoint group validation
// =============================================================================

#[tokio::test]
async fn test_unknown_interface_blocks_checked_runs() {
    let lab = Harness::new();
    lab.inventory.seed("lem01-t01-pwr01", "legacy", "10.62.0.99");
    let options = ManagerOptions {
        check_entrypoint_group: true,
        ..lab.options()
    };
    let mut manager = lab.manager_with(lab.balancers(), options).await.unwrap();

    let summary = manager.create_entrypoints(&names(&["api"])).await.unwrap();
    assert_eq!(summary.failed(), vec!["api"]);
    let message = summary.runs[0].result.as_ref().unwrap_err();
    assert!(message.contains("entrypoint group 'pwr' is not valid"), "{}", message);
    assert!(!summary.runs[0].is_success(vipsync_core::Action::Patch));
    assert!(lab.mutations().is_empty());
}

#[tokio::test]
async fn test_unchecked_runs_ignore_unknown_interfaces() {
    let lab = Harness::new();
    lab.inventory.seed("lem01-t01-pwr01", "legacy", "10.62.0.99");

    let summary = lab.manager().await.unwrap().create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());
}

#[tokio::test]
async fn test_location_without_balancers_is_fatal() {
    let mut info = vipsync_core::test_util::lab_environment();
    info.location = "FRA01".to_string();
    let lab = Harness::with_environment(vipsync_core::test_util::FakeEnvironment::new(info));
    assert!(matches!(lab.manager().await, Err(Error::NoBalancers(location)) if location == "FRA01"));
}

// =============================================================================
// Clean
// =============================================================================

fn split_reservation(lab: &Harness) {
    lab.inventory.seed("lem01-t01-pwr01", "api", "10.62.0.20");
    lab.inventory.seed("lem01-t01-pwr02", "api", "10.62.0.21");
    lab.dns.seed(RecordType::A, "api-lablemams.example.net", "10.62.0.20");
}

#[tokio::test]
async fn test_clean_dry_run_only_reports() {
    let lab = Harness::new();
    split_reservation(&lab);
    let dir = tempfile::tempdir().unwrap();
    let options = ManagerOptions {
        data_dir: dir.path().to_path_buf(),
        ..lab.options()
    };
    let mut manager = lab.manager_with(lab.balancers(), options).await.unwrap();

    let affected = manager.clean_entrypoint("api", false).await.unwrap();
    assert_eq!(affected.len(), 1);
    assert_eq!(affected[0].host_name, "lem01-t01-pwr02");
    assert_eq!(affected[0].ip, "10.62.0.21");
    assert_eq!(lab.inventory.named("api").len(), 2);

    // state and plan are kept for later inspection
    let mut snapshots: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    snapshots.sort();
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots[0].starts_with("Plan_Entrypoint-api-lablemams-"));
    assert!(snapshots[1].starts_with("State_Entrypoint-api-lablemams-"));
}

#[tokio::test]
async fn test_clean_apply_removes_unpublished_interface() {
    let lab = Harness::new();
    split_reservation(&lab);
    let dir = tempfile::tempdir().unwrap();
    let options = ManagerOptions {
        data_dir: dir.path().to_path_buf(),
        ..lab.options()
    };
    let mut manager = lab.manager_with(lab.balancers(), options.clone()).await.unwrap();

    manager.clean_entrypoint("api", true).await.unwrap();
    let remaining = lab.inventory.named("api");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].ip, "10.62.0.20");

    // the entrypoint converges afterwards
    let mut manager = lab.manager_with(lab.balancers(), options).await.unwrap();
    let summary = manager.create_entrypoints(&names(&["api"])).await.unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());
    assert!(lab.inventory.named("api").iter().all(|i| i.ip == "10.62.0.20"));
}

#[tokio::test]
async fn test_clean_of_valid_entrypoint_does_nothing() {
    let lab = Harness::new();
    let mut manager = lab.manager().await.unwrap();
    assert!(manager.clean_entrypoint("api", true).await.unwrap().is_empty());
    assert_eq!(lab.inventory.interfaces().len(), 5);
}

// =============================================================================
// Reports
// =============================================================================

#[tokio::test]
async fn test_run_summary_serializes_per_entrypoint() {
    let lab = Harness::new();
    let summary = lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["service", "api"]))
        .await
        .unwrap();
    assert!(summary.is_success(), "failed: {:?}", summary.failed());

    let value = serde_json::to_value(&summary).unwrap();
    assert_eq!(
        value["service"],
        json!({"Entrypoint": {"patched": true, "siblings": {}}})
    );
    let api = &value["api"]["Entrypoint"];
    assert_eq!(api["patched"], json!(true));
    assert_eq!(
        api["siblings"]["api-lablemams"]["VirtualServerA10"]["siblings"]["443_https"]["VirtualPortA10"]["patched"],
        json!(true)
    );
}

#[tokio::test]
async fn test_inspection_never_mutates() {
    let lab = Harness::new();
    let mut manager = lab.manager().await.unwrap();
    manager.global_plan("gpr").await.unwrap();
    manager.global_state("gpr").await.unwrap();
    manager.global_diff("gpr").await.unwrap();

    assert!(lab.mutations().is_empty());
    assert!(lab.inventory.named("web").is_empty());
}

#[tokio::test]
async fn test_state_of_created_service_walks_the_tree() {
    let lab = Harness::new();
    assert!(lab
        .manager()
        .await
        .unwrap()
        .create_entrypoints(&names(&["web"]))
        .await
        .unwrap()
        .is_success());

    let state = lab.manager().await.unwrap().global_state("gpr").await.unwrap();
    let value = serde_json::to_value(&state).unwrap();
    let web = &value["EntrypointGroup"]["siblings"]["web-lablemams"]["Entrypoint"];
    assert_eq!(web["state"]["dns"]["ips"]["A"], json!(["10.63.0.10"]));
    assert_eq!(web["is_valid"], json!(true));
    let vs = &web["siblings"]["web-lablemams_443"]["VirtualServerF5"];
    assert_eq!(vs["state"]["pool"], json!("lem01-t01-gpr_80"));
}

// =============================================================================
// Selection
// =============================================================================

#[tokio::test]
async fn test_selection_defaults_to_mandatory_entrypoints() {
    let lab = Harness::new();
    let manager = lab.manager().await.unwrap();

    assert_eq!(manager.select_entrypoints(&[], &[], true), vec!["api", "web"]);
    assert_eq!(
        manager.select_entrypoints(&[], &names(&["pwr"]), false),
        vec!["api", "intapi"]
    );
    assert_eq!(manager.all_services().await.unwrap(), vec!["cdn", "gpr", "pwr"]);
    assert_eq!(manager.environment().suffix, "lablemams");
}
