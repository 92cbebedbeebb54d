//! Tree consistency checker
//!
//! Opens a libsql database, validates the nested-set coordinates of every
//! tree, and optionally rebuilds one tree from its parent links.
//!
//! # Usage
//!
//! ```bash
//! # Validate every tree
//! CHANNELTREE_DB_PATH=./data/channels.db cargo run --bin channeltree-check
//!
//! # Rebuild tree 7, then validate everything
//! cargo run --bin channeltree-check -- --db ./data/channels.db --rebuild 7
//! ```
//!
//! Exits non-zero when any tree fails validation.

use anyhow::{bail, Context};
use clap::Parser;
use channeltree_core::db::TursoStore;
use channeltree_core::models::TreeId;
use channeltree_core::services::{TreeContext, TreeService};
use channeltree_core::TreeEngineConfig;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "channeltree-check")]
#[command(about = "Validate nested-set coordinates of every stored tree")]
struct Args {
    /// Database file (overrides CHANNELTREE_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Rebuild this tree from its parent links before validating
    #[arg(long, value_name = "TREE_ID")]
    rebuild: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = TreeEngineConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db_path = args
        .db
        .or_else(|| config.database_path.clone())
        .context("no database given (use --db or CHANNELTREE_DB_PATH)")?;

    tracing::info!("Opening {}", db_path.display());
    let store = TursoStore::open(db_path, config.busy_timeout_ms).await?;
    let service = TreeService::new(Arc::new(store), config);

    if let Some(tree_id) = args.rebuild.map(TreeId) {
        let count = service.rebuild_tree(&TreeContext::new(), tree_id).await?;
        println!("Rebuilt tree {} ({} nodes)", tree_id, count);
    }

    let mut failures = 0usize;
    for tree_id in service.list_tree_ids().await? {
        match service.validate_tree(tree_id).await {
            Ok(count) => println!("tree {}: ok ({} nodes)", tree_id, count),
            Err(e) => {
                failures += 1;
                println!("tree {}: {}", tree_id, e);
            }
        }
    }

    if failures > 0 {
        bail!("{} tree(s) failed validation", failures);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_db_and_rebuild() {
        let args = Args::try_parse_from(["channeltree-check", "--db", "./t.db", "--rebuild", "7"])
            .unwrap();
        assert_eq!(args.db, Some(PathBuf::from("./t.db")));
        assert_eq!(args.rebuild, Some(7));
    }

    #[test]
    fn test_args_reject_bad_tree_id_and_unknown_flags() {
        assert!(Args::try_parse_from(["channeltree-check", "--rebuild", "seven"]).is_err());
        assert!(Args::try_parse_from(["channeltree-check", "--verbose"]).is_err());

        let args = Args::try_parse_from(["channeltree-check"]).unwrap();
        assert!(args.db.is_none() && args.rebuild.is_none());
    }
}
