//! Incremental ingestion: staging files are normalized, merged into each domain's
//! Bronze history under its dedup policy, and swept once the history is committed.

mod history;
mod merge;
mod normalize;
mod staging;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use lake_adapters::{batch_id, decoder_for};
use lake_core::DomainSchema;
use lake_storage::{sha256_hex, LocalObjectStore, ObjectStore, Tier};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use history::{decode_history, encode_history, CommittedHistory, HistoryStore};
pub use merge::{DedupMerger, MergeOutcome, MergeStats};
pub use normalize::{capitalize, coerce, NormalizedBatch, SchemaNormalizer};
pub use staging::{RetentionSweeper, StagingScanner};

pub const CRATE_NAME: &str = "lake-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct DomainRegistry {
    pub domains: Vec<DomainSchema>,
}

impl DomainRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing domain registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, domain_id: &str) -> Option<&DomainSchema> {
        self.domains.iter().find(|d| d.domain_id == domain_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &DomainSchema> {
        self.domains.iter().filter(|d| d.enabled)
    }

    /// Every descriptor must be valid, and two domains may not share an id or a history object.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut histories = HashSet::new();
        for domain in &self.domains {
            domain.validate()?;
            if !ids.insert(domain.domain_id.as_str()) {
                bail!("duplicate domain id {}", domain.domain_id);
            }
            if !histories.insert(domain.bronze_path.as_str()) {
                bail!(
                    "domain {} reuses history path {}",
                    domain.domain_id,
                    domain.bronze_path
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub lake_root: PathBuf,
    pub domains_file: PathBuf,
    /// Where run reports go; `None` disables them.
    pub reports_dir: Option<PathBuf>,
    /// "Today" for horizon windows.
    pub reference_date: NaiveDate,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        let reference_date = match std::env::var("LAKE_REFERENCE_DATE") {
            Ok(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .with_context(|| format!("LAKE_REFERENCE_DATE={raw} is not YYYY-MM-DD"))?,
            Err(_) => Local::now().date_naive(),
        };
        Ok(Self {
            lake_root: std::env::var("LAKE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./lake")),
            domains_file: std::env::var("LAKE_DOMAINS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./domains.yaml")),
            reports_dir: Some(
                std::env::var("LAKE_REPORTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./reports")),
            ),
            reference_date,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumedFile {
    pub path: String,
    pub batch_id: Uuid,
    pub content_hash: String,
    pub rows: usize,
    pub unparseable_cells: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainRunSummary {
    pub domain_id: String,
    pub policy: &'static str,
    pub staged_files: usize,
    pub consumed: Vec<ConsumedFile>,
    pub rejected: Vec<RejectedFile>,
    /// Absent when nothing was consumed and history was left untouched.
    pub merge: Option<MergeStats>,
    pub history_path: String,
    pub history_hash: Option<String>,
    pub swept: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reference_date: NaiveDate,
    pub domains: Vec<DomainRunSummary>,
    pub report_path: Option<String>,
}

pub struct IngestPipeline {
    config: IngestConfig,
    registry: DomainRegistry,
    scanner: StagingScanner,
    history: HistoryStore,
    sweeper: RetentionSweeper,
    store: Arc<dyn ObjectStore>,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig, store: Arc<dyn ObjectStore>, registry: DomainRegistry) -> Self {
        Self {
            config,
            registry,
            scanner: StagingScanner::new(store.clone()),
            history: HistoryStore::new(store.clone()),
            sweeper: RetentionSweeper::new(store.clone()),
            store,
        }
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    /// Ingests every enabled domain in registry order. The first fatal error aborts the run.
    pub async fn run_all(&self) -> Result<Vec<DomainRunSummary>> {
        let mut summaries = Vec::new();
        for schema in self.registry.enabled() {
            summaries.push(self.ingest(schema).await?);
        }
        Ok(summaries)
    }

    /// Ingests one domain by id, whether or not it is enabled.
    pub async fn run_domain(&self, domain_id: &str) -> Result<DomainRunSummary> {
        let schema = self
            .registry
            .get(domain_id)
            .with_context(|| format!("no domain registered as {domain_id}"))?;
        self.ingest(schema).await
    }

    /// One full run with its report; `only` restricts it to a single domain.
    pub async fn run_once(&self, only: Option<&str>) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, reference_date = %self.config.reference_date);

        let domains = async {
            match only {
                Some(domain_id) => Ok(vec![self.run_domain(domain_id).await?]),
                None => self.run_all().await,
            }
        }
        .instrument(span)
        .await?;

        let mut summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            reference_date: self.config.reference_date,
            domains,
            report_path: None,
        };
        if let Some(dir) = &self.config.reports_dir {
            let path = write_report(dir, &summary).await?;
            summary.report_path = Some(path.display().to_string());
        }
        Ok(summary)
    }

    async fn ingest(&self, schema: &DomainSchema) -> Result<DomainRunSummary> {
        let span = info_span!("ingest_domain", domain = %schema.domain_id, policy = schema.dedup.name());
        self.ingest_inner(schema).instrument(span).await
    }

    async fn ingest_inner(&self, schema: &DomainSchema) -> Result<DomainRunSummary> {
        let paths = self.scanner.scan(schema).await?;
        let mut summary = DomainRunSummary {
            domain_id: schema.domain_id.clone(),
            policy: schema.dedup.name(),
            staged_files: paths.len(),
            consumed: Vec::new(),
            rejected: Vec::new(),
            merge: None,
            history_path: schema.bronze_path.clone(),
            history_hash: None,
            swept: 0,
        };
        if paths.is_empty() {
            info!("no staging files; history untouched");
            return Ok(summary);
        }

        let decoder = decoder_for(schema);
        let normalizer = SchemaNormalizer::new(schema);
        let mut staged = Vec::new();
        for path in &paths {
            let bytes = self
                .store
                .get(Tier::Staging, path)
                .await
                .with_context(|| format!("reading staging file {path}"))?;
            match decoder.decode(path, &bytes) {
                Ok(raw) => {
                    let batch = normalizer.normalize(&raw);
                    let content_hash = sha256_hex(&bytes);
                    summary.consumed.push(ConsumedFile {
                        path: path.clone(),
                        batch_id: batch_id(&schema.domain_id, path, &content_hash),
                        content_hash,
                        rows: batch.rows.len(),
                        unparseable_cells: batch.unparseable_cells,
                    });
                    staged.push(batch);
                }
                Err(err) => {
                    warn!(%path, decoder = decoder.format_name(), error = %err, "rejecting staging file");
                    self.sweeper.discard_rejected(path).await?;
                    summary.rejected.push(RejectedFile {
                        path: path.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        if staged.is_empty() {
            info!(rejected = summary.rejected.len(), "nothing ingestible; history untouched");
            return Ok(summary);
        }

        let current = self.history.load(schema).await?;
        let outcome = DedupMerger::new(schema, self.config.reference_date)
            .merge(current, &staged)
            .with_context(|| format!("merging staging into {}", schema.bronze_path))?;
        let committed = self.history.save(schema, &outcome.history).await?;

        let consumed: Vec<String> = summary.consumed.iter().map(|c| c.path.clone()).collect();
        summary.swept = self.sweeper.sweep(schema, &committed, &consumed).await?;

        let stats = outcome.stats;
        info!(
            files = consumed.len(),
            rejected = summary.rejected.len(),
            added = stats.added,
            replaced = stats.replaced,
            skipped_known_key = stats.skipped_known_key,
            history_rows = stats.result_rows,
            "domain ingested"
        );
        summary.history_hash = Some(committed.content_hash);
        summary.merge = Some(stats);
        Ok(summary)
    }
}

async fn write_report(reports_dir: &Path, summary: &IngestRunSummary) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let path = reports_dir.join(format!("{}.json", summary.run_id));
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn run_ingest_once_from_env(domain: Option<String>) -> Result<IngestRunSummary> {
    let config = IngestConfig::from_env()?;
    let registry = DomainRegistry::load(&config.domains_file).await?;
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(config.lake_root.clone()));
    let pipeline = IngestPipeline::new(config, store, registry);
    pipeline.run_once(domain.as_deref()).await
}
