use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lake_core::DomainSchema;
use lake_storage::{ObjectStore, Tier};
use tracing::debug;

use crate::history::CommittedHistory;

/// Lists the staging files waiting for a domain, in deterministic path order.
pub struct StagingScanner {
    store: Arc<dyn ObjectStore>,
}

impl StagingScanner {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn scan(&self, schema: &DomainSchema) -> Result<Vec<String>> {
        let mut paths = self
            .store
            .list(Tier::Staging, &schema.staging_prefix)
            .await
            .with_context(|| format!("listing staging for {}", schema.domain_id))?;
        paths.retain(|p| is_data_entry(p));
        paths.sort();
        paths.dedup();
        debug!(domain = %schema.domain_id, files = paths.len(), "staging scanned");
        Ok(paths)
    }
}

/// Directories and hidden entries (in-flight `.tmp` partials among them) are never data.
fn is_data_entry(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    !path.ends_with('/') && !name.is_empty() && !name.starts_with('.')
}

/// Deletes staging files once their contents are safely in history.
pub struct RetentionSweeper {
    store: Arc<dyn ObjectStore>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Removes consumed files. Needs the commit token, so it cannot run before a save;
    /// the token and every path must belong to `schema`, or nothing is deleted.
    pub async fn sweep(
        &self,
        schema: &DomainSchema,
        committed: &CommittedHistory,
        consumed: &[String],
    ) -> Result<usize> {
        if committed.domain_id != schema.domain_id || committed.path != schema.bronze_path {
            bail!(
                "commit for {} ({}) cannot release staging of {}",
                committed.domain_id,
                committed.path,
                schema.domain_id
            );
        }
        if let Some(stray) = consumed.iter().find(|p| !p.starts_with(&schema.staging_prefix)) {
            bail!(
                "{stray} is outside staging prefix {} of {}",
                schema.staging_prefix,
                schema.domain_id
            );
        }
        for path in consumed {
            self.store.delete(Tier::Staging, path).await.with_context(|| {
                format!("sweeping {path} after committing {}", committed.path)
            })?;
        }
        debug!(domain = %committed.domain_id, removed = consumed.len(), "staging swept");
        Ok(consumed.len())
    }

    /// Drops a staging file that can never be ingested (empty or undecodable).
    pub async fn discard_rejected(&self, path: &str) -> Result<()> {
        self.store
            .delete(Tier::Staging, path)
            .await
            .with_context(|| format!("deleting rejected staging file {path}"))
    }
}
