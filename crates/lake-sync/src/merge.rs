//! Merge of normalized staging rows into history under a domain's dedup policy.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use chrono::NaiveDate;
use lake_core::{Dataset, DedupPolicy, DomainSchema, Horizon, Value};
use serde::Serialize;

use crate::normalize::NormalizedBatch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub history_rows: usize,
    pub staged_rows: usize,
    /// Staged records that became part of history under a key history did not have.
    pub added: usize,
    /// Staged rows dropped because history (or an earlier file) already owns their key.
    pub skipped_known_key: usize,
    pub skipped_null_key: usize,
    /// Staged rows discarded in favour of another row with the same key.
    pub collapsed_duplicates: usize,
    /// History records superseded by a newer staged version.
    pub replaced: usize,
    pub excluded_by_horizon: usize,
    pub result_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub history: Dataset,
    pub stats: MergeStats,
}

pub struct DedupMerger<'a> {
    schema: &'a DomainSchema,
    reference_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    History,
    Staged,
}

impl<'a> DedupMerger<'a> {
    pub fn new(schema: &'a DomainSchema, reference_date: NaiveDate) -> Self {
        Self {
            schema,
            reference_date,
        }
    }

    /// Staged batches must be supplied in scanner order; tie-breaks depend on it.
    pub fn merge(&self, history: Dataset, staged: &[NormalizedBatch]) -> Result<MergeOutcome> {
        let columns = self.schema.canonical_columns();
        if history.columns() != columns.as_slice() {
            bail!(
                "history for {} does not match the canonical schema",
                self.schema.domain_id
            );
        }
        if let Some(batch) = staged.iter().find(|b| b.rows.columns() != columns.as_slice()) {
            bail!(
                "staged batch {} for {} does not match the canonical schema",
                batch.path,
                self.schema.domain_id
            );
        }

        let mut stats = MergeStats {
            history_rows: history.len(),
            staged_rows: staged.iter().map(|b| b.rows.len()).sum(),
            ..MergeStats::default()
        };

        let rows = match &self.schema.dedup {
            DedupPolicy::Temporal {
                date_column,
                row_key,
            } => {
                let date_idx = index_of(&history, date_column)?;
                let key_idx = indices_of(&history, row_key)?;
                merge_temporal(history.into_rows(), staged, date_idx, &key_idx, &mut stats)
            }
            DedupPolicy::Natural {
                key,
                updated_by,
                horizon,
            } => {
                let key_idx = indices_of(&history, key)?;
                let updated_idx = indices_of(&history, updated_by)?;
                let horizon = horizon
                    .as_ref()
                    .map(|h| index_of(&history, &h.column).map(|idx| (h, idx)))
                    .transpose()?;
                let rows =
                    merge_natural(history.into_rows(), staged, &key_idx, &updated_idx, &mut stats);
                match horizon {
                    Some((h, idx)) => self.apply_horizon(rows, h, idx, &mut stats),
                    None => rows,
                }
            }
        };

        stats.result_rows = rows.len();
        Ok(MergeOutcome {
            history: Dataset::new(columns, rows),
            stats,
        })
    }

    fn apply_horizon(
        &self,
        rows: Vec<Vec<Value>>,
        horizon: &Horizon,
        idx: usize,
        stats: &mut MergeStats,
    ) -> Vec<Vec<Value>> {
        let before = rows.len();
        let kept: Vec<_> = rows
            .into_iter()
            .filter(|row| horizon.retains(&row[idx], self.reference_date))
            .collect();
        stats.excluded_by_horizon = before - kept.len();
        kept
    }
}

fn index_of(dataset: &Dataset, column: &str) -> Result<usize> {
    match dataset.column_index(column) {
        Some(idx) => Ok(idx),
        None => bail!("dedup column {column} is not part of the canonical schema"),
    }
}

fn indices_of(dataset: &Dataset, columns: &[String]) -> Result<Vec<usize>> {
    columns.iter().map(|c| index_of(dataset, c)).collect()
}

fn project(row: &[Value], idx: &[usize]) -> Vec<Value> {
    idx.iter().map(|&i| row[i].clone()).collect()
}

/// Set-dedup: history is never altered; a business date not yet in history is
/// owned by the first staged file carrying it.
fn merge_temporal(
    mut rows: Vec<Vec<Value>>,
    staged: &[NormalizedBatch],
    date_idx: usize,
    key_idx: &[usize],
    stats: &mut MergeStats,
) -> Vec<Vec<Value>> {
    // Dates are compared by calendar day, so a date_time column owns whole days too.
    let known: HashSet<NaiveDate> = rows.iter().filter_map(|r| r[date_idx].as_date()).collect();
    let mut seen_keys: HashSet<Vec<Value>> = if key_idx.is_empty() {
        HashSet::new()
    } else {
        rows.iter().map(|r| project(r, key_idx)).collect()
    };
    let mut owner: HashMap<NaiveDate, usize> = HashMap::new();

    for (batch_no, batch) in staged.iter().enumerate() {
        for row in batch.rows.rows() {
            let Some(date) = row[date_idx].as_date() else {
                stats.skipped_null_key += 1;
                continue;
            };
            if known.contains(&date) {
                stats.skipped_known_key += 1;
                continue;
            }
            if *owner.entry(date).or_insert(batch_no) != batch_no {
                stats.skipped_known_key += 1;
                continue;
            }
            if !key_idx.is_empty() && !seen_keys.insert(project(row, key_idx)) {
                stats.collapsed_duplicates += 1;
                continue;
            }
            rows.push(row.clone());
            stats.added += 1;
        }
    }
    rows
}

struct Slot {
    updated: Vec<Value>,
    origin: Origin,
    row: Vec<Value>,
}

/// Tie-break: per natural key the greatest `updated_by` tuple wins; on equal
/// tuples the later row in history -> staged-file -> row order wins.
fn merge_natural(
    history: Vec<Vec<Value>>,
    staged: &[NormalizedBatch],
    key_idx: &[usize],
    updated_idx: &[usize],
    stats: &mut MergeStats,
) -> Vec<Vec<Value>> {
    let mut slots: Vec<Slot> = Vec::new();
    let mut by_key: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut history_keys: HashSet<Vec<Value>> = HashSet::new();

    let candidates = history
        .into_iter()
        .map(|row| (Origin::History, row))
        .chain(
            staged
                .iter()
                .flat_map(|b| b.rows.rows().iter().cloned())
                .map(|row| (Origin::Staged, row)),
        );

    for (origin, row) in candidates {
        let key = project(&row, key_idx);
        let updated = project(&row, updated_idx);
        if key.iter().all(Value::is_null) {
            // Keyless history rows are kept as-is; keyless staged rows cannot be placed.
            match origin {
                Origin::History => slots.push(Slot {
                    updated,
                    origin,
                    row,
                }),
                Origin::Staged => stats.skipped_null_key += 1,
            }
            continue;
        }
        if origin == Origin::History {
            history_keys.insert(key.clone());
        }
        match by_key.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(slots.len());
                slots.push(Slot {
                    updated,
                    origin,
                    row,
                });
            }
            Entry::Occupied(occupied) => {
                let slot = &mut slots[*occupied.get()];
                if updated >= slot.updated {
                    if origin == Origin::Staged {
                        stats.collapsed_duplicates += usize::from(slot.origin == Origin::Staged);
                    }
                    *slot = Slot {
                        updated,
                        origin,
                        row,
                    };
                } else if origin == Origin::Staged {
                    stats.collapsed_duplicates += 1;
                }
            }
        }
    }

    for (key, &slot_no) in &by_key {
        let slot = &slots[slot_no];
        if slot.origin == Origin::Staged {
            if history_keys.contains(key) {
                stats.replaced += 1;
            } else {
                stats.added += 1;
            }
        }
    }

    slots.into_iter().map(|s| s.row).collect()
}
