//! Plan/state snapshots written before destructive cleanup.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::error::Result;

/// Write `State_{kind}-{name}-{ts}.json` and `Plan_{kind}-{name}-{ts}.json`
/// into `dir`, returning both paths.
pub async fn save<S: Serialize, P: Serialize>(
    dir: &Path,
    kind: &str,
    name: &str,
    state: &S,
    plan: &P,
) -> Result<(PathBuf, PathBuf)> {
    tokio::fs::create_dir_all(dir).await?;
    let now = Utc::now();
    let ts = format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros());

    let state_path = dir.join(format!("State_{}-{}-{}.json", kind, name, ts));
    let plan_path = dir.join(format!("Plan_{}-{}-{}.json", kind, name, ts));
    tokio::fs::write(&state_path, serde_json::to_vec_pretty(state)?).await?;
    tokio::fs::write(&plan_path, serde_json::to_vec_pretty(plan)?).await?;

    info!(state = %state_path.display(), plan = %plan_path.display(), "saved snapshot");
    Ok((state_path, plan_path))
}
