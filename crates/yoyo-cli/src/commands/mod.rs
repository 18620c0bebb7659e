//! Command implementations behind the `yoyo` subcommands.

pub mod list;
pub mod new;

use anyhow::Result;

use yoyo_migrations::{
    get_backend, read_migrations, DependencyGraph, ExecutionReport, Executor, Operation,
};

use crate::prompt;
use crate::settings::Settings;

/// Loads sources, connects, and runs one engine operation. Installs the
/// interactive prompt unless batch mode is on.
pub async fn run_engine_operation(
    settings: &Settings,
    op: Operation,
    revision: Option<&str>,
    force: bool,
    limit: Option<usize>,
) -> Result<ExecutionReport> {
    let sources = settings.require_sources()?;
    let set = read_migrations(sources)?;
    let config = settings.migration_config();
    let backend = get_backend(settings.database()?, &config).await?;
    let graph = DependencyGraph::new(set)?;

    let mut executor = Executor::new(backend.as_ref(), &config);
    if !config.batch_mode {
        executor = executor.with_confirm(prompt::confirm());
    }
    if let Some(n) = limit {
        executor = executor.with_limit(n);
    }

    Ok(executor.run_operation(&graph, op, revision, force).await?)
}

/// Prints what a finished run did.
pub fn print_report(report: &ExecutionReport) {
    for id in &report.applied {
        println!("applied {id}");
    }
    for id in &report.rolled_back {
        println!("rolled back {id}");
    }
    for id in &report.marked {
        println!("marked {id}");
    }
    for id in &report.unmarked {
        println!("unmarked {id}");
    }
    for id in &report.skipped {
        println!("skipped {id}");
    }
    for id in &report.failed {
        println!("FAILED {id}");
    }
    if report.post_apply_ran {
        println!("post-apply hook ran");
    }
    if report.applied.is_empty()
        && report.rolled_back.is_empty()
        && report.marked.is_empty()
        && report.unmarked.is_empty()
        && report.skipped.is_empty()
        && report.failed.is_empty()
    {
        println!("nothing to do");
    }
}
