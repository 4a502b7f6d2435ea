use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use themewatch_common::{AnalysisRun, Config};
use themewatch_discovery::{IncludePolicy, PipelineCoordinator, PipelineDeps};
use themewatch_store::{migrate::migrate, PgArticleStore, PgRunStore, PgVectorIndex};

const USAGE: &str = "usage: themewatch <scope> [--unassigned | --incremental] | themewatch --resume <run-id>";

enum Command {
    Run { scope: String, policy: IncludePolicy },
    Resume(Uuid),
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args {
        [flag, id] if flag == "--resume" => {
            let id = Uuid::parse_str(id).with_context(|| format!("invalid run id: {id}"))?;
            Ok(Command::Resume(id))
        }
        [scope] if !scope.starts_with("--") => Ok(Command::Run {
            scope: scope.clone(),
            policy: IncludePolicy::All,
        }),
        [scope, flag] if !scope.starts_with("--") => {
            let policy = match flag.as_str() {
                "--unassigned" => IncludePolicy::Unassigned,
                "--incremental" => IncludePolicy::SinceLastCompletedRun,
                other => bail!("unknown flag {other}\n{USAGE}"),
            };
            Ok(Command::Run {
                scope: scope.clone(),
                policy,
            })
        }
        _ => bail!(USAGE),
    }
}

fn print_summary(run: &AnalysisRun) {
    let c = &run.counts;
    println!("=== Analysis Run {} ===", run.id);
    println!("Scope:              {}", run.scope);
    println!("Status:             {}", run.status());
    println!("Documents:          {}", c.documents);
    println!("Clusters:           {}", c.clusters);
    println!("Outliers:           {}", c.outliers);
    println!("Potential topics:   {}", c.potential_topics);
    println!("Merge suggestions:  {}", c.merge_suggestions);
    println!("Vector assigned:    {}", c.assigned_in_vector_store);
    println!("Relational assigned:{}", c.assigned_in_relational_store);
    println!("Propagation errors: {}", c.propagation_errors);
    println!("Temporal metrics:   {}", c.temporal_metrics);
    if let Some(kind) = run.failure_kind() {
        println!("Last failure:       {kind}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("themewatch=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let config = Config::from_env()?;
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    migrate(&pool).await?;

    // Ctrl-C stops the run at the next stage boundary.
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current stage");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let deps = PipelineDeps::builder()
        .vectors(Arc::new(PgVectorIndex::new(pool.clone())))
        .articles(Arc::new(PgArticleStore::new(pool.clone())))
        .runs(Arc::new(PgRunStore::new(pool.clone())))
        .config(config.discovery.clone())
        .cancelled(Some(cancelled))
        .build();
    let coordinator = PipelineCoordinator::new(deps);

    let run = match command {
        Command::Run { scope, policy } => {
            info!(scope = scope.as_str(), ?policy, "Theme Watch starting...");
            coordinator.run(&scope, policy).await?
        }
        Command::Resume(id) => {
            info!(run_id = %id, "Theme Watch resuming...");
            coordinator.resume(id).await?
        }
    };

    print_summary(&run);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn scope_alone_clusters_everything() {
        let Command::Run { scope, policy } = parse_args(&args(&["acme"])).unwrap() else {
            panic!("expected a run");
        };
        assert_eq!(scope, "acme");
        assert_eq!(policy, IncludePolicy::All);
    }

    #[test]
    fn incremental_flag_resolves_later() {
        let Command::Run { policy, .. } = parse_args(&args(&["acme", "--incremental"])).unwrap() else {
            panic!("expected a run");
        };
        assert_eq!(policy, IncludePolicy::SinceLastCompletedRun);
    }

    #[test]
    fn resume_needs_a_valid_run_id() {
        assert!(parse_args(&args(&["--resume", "not-a-uuid"])).is_err());
        let id = Uuid::new_v4().to_string();
        assert!(matches!(parse_args(&args(&["--resume", &id])).unwrap(), Command::Resume(_)));
        assert!(parse_args(&args(&[])).is_err());
    }
}
