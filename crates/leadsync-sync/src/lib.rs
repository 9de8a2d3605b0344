//! Lead sync orchestration: dedupe against the seen store, write new leads out.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use leadsync_adapters::{load_sample_leads, normalize_lead, GraphLeadsFetcher, PageClient};
use leadsync_core::{ContactRecord, LeadSyncConfig, OutputFormat, RawRecord};
use leadsync_storage::{HttpFetcher, SeenStore};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-sync";

/// Leading CSV columns; any other keys follow in lexicographic order.
pub const PRIMARY_COLUMNS: [&str; 5] = ["id", "name", "email", "phone", "created_time"];

/// Per-invocation knobs taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub since: Option<String>,
    pub output: OutputFormat,
    pub db_path: Option<PathBuf>,
    pub dry_run: bool,
    pub max_pages: Option<usize>,
    pub mock_sample: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub total_count: usize,
    pub accepted_count: usize,
    pub output_path: Option<String>,
    pub dry_run: bool,
    pub seen_store_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineOutcome {
    pub total_count: usize,
    pub accepted_count: usize,
    pub output_path: Option<PathBuf>,
}

/// Why a normalized lead was or was not taken into the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadDisposition {
    Accepted,
    MissingId,
    MissingContact,
    AlreadySeen,
}

/// Normalize → validate → dedupe → mark. Owns every mutation of the seen store.
#[derive(Debug)]
pub struct Pipeline {
    store: SeenStore,
    output_dir: PathBuf,
}

impl Pipeline {
    pub fn new(config: &LeadSyncConfig, store: SeenStore) -> Self {
        Self {
            store,
            output_dir: config.output_dir.clone(),
        }
    }

    pub fn store(&self) -> &SeenStore {
        &self.store
    }

    pub fn close(&mut self) {
        self.store.close();
    }

    pub fn evaluate(&self, record: &ContactRecord) -> Result<LeadDisposition> {
        let Some(lead_id) = record.lead_id() else {
            return Ok(LeadDisposition::MissingId);
        };
        if !record.has_contact_channel() {
            return Ok(LeadDisposition::MissingContact);
        }
        if self
            .store
            .exists(lead_id)
            .with_context(|| format!("checking seen store for lead {lead_id}"))?
        {
            return Ok(LeadDisposition::AlreadySeen);
        }
        Ok(LeadDisposition::Accepted)
    }

    /// Returns the leads not seen before, in input order. Unless `dry_run`,
    /// each accepted id is marked immediately, before the next record.
    pub fn select_new_leads(
        &self,
        raw_records: &[RawRecord],
        dry_run: bool,
    ) -> Result<Vec<ContactRecord>> {
        let mut accepted = Vec::new();
        for raw in raw_records {
            let record = normalize_lead(raw);
            match self.evaluate(&record)? {
                LeadDisposition::MissingId => {
                    warn!(raw = %raw, "skipping lead with no id");
                }
                LeadDisposition::MissingContact => {
                    error!(
                        lead_id = record.id.as_deref().unwrap_or_default(),
                        "skipping lead missing contact info"
                    );
                }
                LeadDisposition::AlreadySeen => {
                    debug!(lead_id = record.id.as_deref().unwrap_or_default(), "already seen");
                }
                LeadDisposition::Accepted => {
                    let lead_id = record.id.clone().unwrap_or_default();
                    if !dry_run {
                        self.store
                            .mark(&lead_id)
                            .with_context(|| format!("marking lead {lead_id} as seen"))?;
                    }
                    info!(lead_id = lead_id.as_str(), dry_run, "accepted new lead");
                    accepted.push(record);
                }
            }
        }
        Ok(accepted)
    }

    pub fn run(
        &self,
        raw_records: &[RawRecord],
        format: OutputFormat,
        dry_run: bool,
    ) -> Result<PipelineOutcome> {
        let accepted = self.select_new_leads(raw_records, dry_run)?;
        let output_path = write_output(&accepted, format, &self.output_dir)?;
        Ok(PipelineOutcome {
            total_count: raw_records.len(),
            accepted_count: accepted.len(),
            output_path,
        })
    }
}

/// Writes `records` to `new_leads.{json,csv}` under `output_dir`, replacing any
/// earlier file. Nothing is written for an empty batch.
pub fn write_output(
    records: &[ContactRecord],
    format: OutputFormat,
    output_dir: &Path,
) -> Result<Option<PathBuf>> {
    if records.is_empty() {
        info!("no new leads to write");
        return Ok(None);
    }
    let path = output_dir.join(format.file_name());
    match format {
        OutputFormat::Json => write_json(&path, records)?,
        OutputFormat::Csv => write_csv(&path, records)?,
    }
    info!(count = records.len(), path = %path.display(), "wrote new leads");
    Ok(Some(path))
}

fn write_json(path: &Path, records: &[ContactRecord]) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(records).context("serializing new leads")?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn record_rows(records: &[ContactRecord]) -> Result<Vec<Map<String, JsonValue>>> {
    records
        .iter()
        .map(|record| -> Result<Map<String, JsonValue>> {
            match serde_json::to_value(record)? {
                JsonValue::Object(map) => Ok(map),
                other => anyhow::bail!("lead serialized to non-object {other}"),
            }
        })
        .collect()
}

/// Union of all row keys: the primary columns first, then the rest sorted.
pub fn csv_columns(rows: &[Map<String, JsonValue>]) -> Vec<String> {
    let extra: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .filter(|key| !PRIMARY_COLUMNS.iter().any(|c| *c == *key))
        .collect();
    PRIMARY_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(extra.into_iter().map(ToString::to_string))
        .collect()
}

/// Strings as-is, null/missing as an empty cell, anything else as compact JSON.
fn cell_text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn write_csv(path: &Path, records: &[ContactRecord]) -> Result<()> {
    let rows = record_rows(records)?;
    let columns = csv_columns(&rows);

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record(&columns)
        .context("writing csv header")?;
    for row in &rows {
        writer
            .write_record(columns.iter().map(|c| cell_text(row.get(c))))
            .context("writing csv row")?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// Runs one sync: load raw leads (API or sample fixture), dedupe, write, summarize.
pub async fn run_once(config: &LeadSyncConfig, options: &RunOptions) -> Result<SyncRunSummary> {
    if options.mock_sample {
        run_with_source::<HttpFetcher>(config, options, LeadSource::Sample).await
    } else {
        config.require_credentials()?;
        let fetcher = GraphLeadsFetcher::from_config(config)?;
        run_with_source(config, options, LeadSource::Graph(&fetcher)).await
    }
}

/// Same as [`run_once`] but against a caller-supplied page client.
pub async fn run_once_with_client<C: PageClient>(
    config: &LeadSyncConfig,
    options: &RunOptions,
    fetcher: &GraphLeadsFetcher<C>,
) -> Result<SyncRunSummary> {
    run_with_source(config, options, LeadSource::Graph(fetcher)).await
}

enum LeadSource<'a, C> {
    Sample,
    Graph(&'a GraphLeadsFetcher<C>),
}

async fn run_with_source<C: PageClient>(
    config: &LeadSyncConfig,
    options: &RunOptions,
    source: LeadSource<'_, C>,
) -> Result<SyncRunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let db_path = options
        .db_path
        .clone()
        .unwrap_or_else(|| config.db_path.clone());
    let store = SeenStore::open(&db_path)
        .with_context(|| format!("opening seen store {}", db_path.display()))?;

    let (source_name, raw_leads) = match source {
        LeadSource::Sample => {
            let leads = load_sample_leads(&config.sample_path)?;
            info!(count = leads.len(), path = %config.sample_path.display(), "loaded sample leads");
            ("sample", leads)
        }
        LeadSource::Graph(fetcher) => {
            let leads = fetcher
                .fetch_leads(options.since.as_deref(), options.max_pages)
                .await
                .context("fetching leads from graph api")?;
            ("graph", leads)
        }
    };

    let mut pipeline = Pipeline::new(config, store);
    let outcome = pipeline.run(&raw_leads, options.output, options.dry_run)?;
    let seen_store_size = pipeline.store().len().context("counting seen leads")?;
    pipeline.close();

    info!(
        %run_id,
        total = outcome.total_count,
        accepted = outcome.accepted_count,
        "fetched {} raw leads, {} new leads",
        outcome.total_count,
        outcome.accepted_count
    );

    Ok(SyncRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        source: source_name.to_string(),
        total_count: outcome.total_count,
        accepted_count: outcome.accepted_count,
        output_path: outcome.output_path.map(|p| p.display().to_string()),
        dry_run: options.dry_run,
        seen_store_size,
    })
}
