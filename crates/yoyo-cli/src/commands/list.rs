//! The `yoyo list` command: migration status without mutating anything.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;

use yoyo_migrations::{get_backend, read_migrations, DependencyGraph};

use crate::settings::Settings;

/// One row of `yoyo list` output.
#[derive(Debug, Serialize)]
struct MigrationStatus {
    id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    applied_at: Option<String>,
}

/// Lists every known migration in apply order, with applied timestamps,
/// plus any applied identities whose definitions are missing. Read-only:
/// the advisory lock is not taken.
pub async fn list(settings: &Settings, json: bool) -> Result<()> {
    let sources = settings.require_sources()?;
    let set = read_migrations(sources)?;
    let config = settings.migration_config();
    let backend = get_backend(settings.database()?, &config).await?;

    let applied: HashMap<String, String> = backend
        .list_applied()
        .await?
        .into_iter()
        .map(|row| (row.id, row.ctime.format("%Y-%m-%d %H:%M:%S").to_string()))
        .collect();

    let graph = DependencyGraph::new(set)?;
    let mut rows = Vec::new();
    for index in graph.topo_order()? {
        let id = graph.migration(index).id.clone();
        let applied_at = applied.get(&id).cloned();
        rows.push(MigrationStatus {
            status: if applied_at.is_some() {
                "applied"
            } else {
                "pending"
            },
            id,
            applied_at,
        });
    }

    // Applied identities with no definition in the sources.
    let mut stale: Vec<&String> = applied
        .keys()
        .filter(|id| graph.index_of(id).is_none())
        .collect();
    stale.sort();
    for id in stale {
        rows.push(MigrationStatus {
            id: id.clone(),
            status: "unknown",
            applied_at: applied.get(id).cloned(),
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{:<10} {:<40} APPLIED AT", "STATUS", "ID");
        for row in rows {
            println!(
                "{:<10} {:<40} {}",
                row.status,
                row.id,
                row.applied_at.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}
