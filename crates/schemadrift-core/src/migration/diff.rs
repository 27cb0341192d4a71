//! Schema diffing.
//!
//! Compares a provider's cached descriptor with a freshly inferred one and
//! produces the structural steps between them. Columns are matched by name
//! first; leftover columns are paired as renames when their sampled values
//! overlap enough.

use super::plan::{MigrationStep, StepType};
use crate::descriptor::{ColumnDescriptor, SchemaDescriptor};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Minimum share of a previous column's sampled values that must reappear in
/// a new column for the pair to count as a rename.
pub const RENAME_OVERLAP_THRESHOLD: f64 = 0.8;

/// A column pair accepted as a rename.
#[derive(Debug, Clone, PartialEq)]
pub struct RenameMatch {
    /// Name in the previous descriptor.
    pub from: String,
    /// Name in the new descriptor.
    pub to: String,
    /// Value overlap of the pair.
    pub overlap: f64,
    /// Other previous columns that scored the same against `to`.
    pub ambiguous_with: Vec<String>,
}

/// Computes steps between two descriptors.
#[derive(Debug, Clone)]
pub struct SchemaDiffer {
    rename_threshold: f64,
}

impl Default for SchemaDiffer {
    fn default() -> Self {
        Self::new(RENAME_OVERLAP_THRESHOLD)
    }
}

impl SchemaDiffer {
    /// Create a differ with a rename threshold.
    pub fn new(rename_threshold: f64) -> Self {
        Self { rename_threshold }
    }

    /// Steps that turn `previous` into `new`, unordered.
    pub fn diff(
        &self,
        previous: Option<&SchemaDescriptor>,
        new: &SchemaDescriptor,
    ) -> Vec<MigrationStep> {
        let Some(previous) = previous else {
            return new.columns.iter().map(Self::add_step).collect();
        };

        let prev_names: HashSet<&str> = previous.columns.iter().map(|c| c.name.as_str()).collect();
        let new_names: HashSet<&str> = new.columns.iter().map(|c| c.name.as_str()).collect();

        let unmatched_prev: Vec<&ColumnDescriptor> = previous
            .columns
            .iter()
            .filter(|c| !new_names.contains(c.name.as_str()))
            .collect();
        let unmatched_new: Vec<&ColumnDescriptor> = new
            .columns
            .iter()
            .filter(|c| !prev_names.contains(c.name.as_str()))
            .collect();

        let renames = self.match_renames(&previous.provider_id, &unmatched_prev, &unmatched_new);
        let renamed_from: HashSet<&str> = renames.iter().map(|r| r.from.as_str()).collect();
        let renamed_to: HashSet<&str> = renames.iter().map(|r| r.to.as_str()).collect();

        let mut steps = Vec::new();

        for column in unmatched_new.iter().filter(|c| !renamed_to.contains(c.name.as_str())) {
            steps.push(Self::add_step(column));
        }

        for column in unmatched_prev.iter().filter(|c| !renamed_from.contains(c.name.as_str())) {
            steps.push(
                MigrationStep::new(
                    StepType::RemoveColumn,
                    &column.name,
                    column.ordinal_position,
                    format!("remove column '{}'", column.name),
                )
                .with_values(Some(column.inferred_type.to_string()), None),
            );
        }

        // (previous column, new column) pairs that survive under some name.
        let mut survivors: Vec<(&ColumnDescriptor, &ColumnDescriptor)> = Vec::new();
        for column in &new.columns {
            if let Some(prev) = previous.column(&column.name) {
                survivors.push((prev, column));
            }
        }
        for rename in &renames {
            if let (Some(prev), Some(column)) = (previous.column(&rename.from), new.column(&rename.to)) {
                survivors.push((prev, column));
                steps.push(Self::rename_step(rename, column));
            }
        }

        for (prev, column) in &survivors {
            steps.extend(Self::column_changes(prev, column));
        }
        steps.extend(Self::reorders(&survivors));

        steps
    }

    /// Pair unmatched previous columns with unmatched new columns.
    ///
    /// Candidates are taken greedily by overlap (descending), then previous
    /// name, then new name. Each column joins at most one rename.
    pub fn match_renames(
        &self,
        provider_id: &str,
        unmatched_prev: &[&ColumnDescriptor],
        unmatched_new: &[&ColumnDescriptor],
    ) -> Vec<RenameMatch> {
        let mut candidates: Vec<(f64, &ColumnDescriptor, &ColumnDescriptor)> = Vec::new();
        for prev in unmatched_prev {
            for new in unmatched_new {
                if !prev.inferred_type.is_compatible_with(&new.inferred_type) {
                    continue;
                }
                let overlap = prev.value_overlap(new);
                if overlap >= self.rename_threshold {
                    candidates.push((overlap, *prev, *new));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.name.cmp(&b.1.name))
                .then_with(|| a.2.name.cmp(&b.2.name))
        });

        let mut used_prev: HashSet<&str> = HashSet::new();
        let mut used_new: HashSet<&str> = HashSet::new();
        let mut matches = Vec::new();

        for (overlap, prev, new) in &candidates {
            if used_prev.contains(prev.name.as_str()) || used_new.contains(new.name.as_str()) {
                continue;
            }
            let ambiguous_with: Vec<String> = candidates
                .iter()
                .filter(|(o, p, n)| {
                    n.name == new.name
                        && p.name != prev.name
                        && *o == *overlap
                        && !used_prev.contains(p.name.as_str())
                })
                .map(|(_, p, _)| p.name.clone())
                .collect();
            if !ambiguous_with.is_empty() {
                warn!(
                    provider = provider_id,
                    column = %new.name,
                    chosen = %prev.name,
                    candidates = ?ambiguous_with,
                    overlap,
                    "ambiguous rename"
                );
            }

            used_prev.insert(prev.name.as_str());
            used_new.insert(new.name.as_str());
            matches.push(RenameMatch {
                from: prev.name.clone(),
                to: new.name.clone(),
                overlap: *overlap,
                ambiguous_with,
            });
        }
        matches
    }

    fn add_step(column: &ColumnDescriptor) -> MigrationStep {
        MigrationStep::new(
            StepType::AddColumn,
            &column.name,
            column.ordinal_position,
            format!("add column '{}' ({})", column.name, column.inferred_type),
        )
        .with_values(None, Some(column.inferred_type.to_string()))
        .with_column(column.clone())
    }

    fn rename_step(rename: &RenameMatch, column: &ColumnDescriptor) -> MigrationStep {
        let mut description = format!(
            "rename column '{}' to '{}' (overlap {:.2})",
            rename.from, rename.to, rename.overlap
        );
        if !rename.ambiguous_with.is_empty() {
            description.push_str(&format!(
                "; ambiguous rename, also matched {}",
                rename
                    .ambiguous_with
                    .iter()
                    .map(|n| format!("'{}'", n))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        MigrationStep::new(
            StepType::RenameColumn,
            &rename.from,
            column.ordinal_position,
            description,
        )
        .with_values(Some(rename.from.clone()), Some(rename.to.clone()))
        .with_column(column.clone())
    }

    /// Type and flag changes of a surviving column. Steps use the previous
    /// name since they run before renames.
    fn column_changes(prev: &ColumnDescriptor, new: &ColumnDescriptor) -> Vec<MigrationStep> {
        let mut steps = Vec::new();
        let name = prev.name.as_str();
        let position = new.ordinal_position;

        if prev.inferred_type != new.inferred_type {
            let step_type = if prev.inferred_type.widens_to(&new.inferred_type) {
                StepType::IncreasePrecision
            } else if prev.inferred_type.narrows_to(&new.inferred_type) {
                StepType::ReduceSize
            } else {
                StepType::ChangeType
            };
            steps.push(
                MigrationStep::new(
                    step_type,
                    name,
                    position,
                    format!(
                        "change type of '{}' from {} to {}",
                        name, prev.inferred_type, new.inferred_type
                    ),
                )
                .with_values(
                    Some(prev.inferred_type.to_string()),
                    Some(new.inferred_type.to_string()),
                )
                .with_column(new.clone()),
            );
        }

        if prev.unique != new.unique {
            let (step_type, verb) = if new.unique {
                (StepType::AddIndex, "add unique index on")
            } else {
                (StepType::DropIndex, "drop unique index on")
            };
            steps.push(
                MigrationStep::new(step_type, name, position, format!("{} '{}'", verb, name))
                    .with_values(Some(prev.unique.to_string()), Some(new.unique.to_string()))
                    .with_column(new.clone()),
            );
        }

        if prev.nullable != new.nullable {
            let state = |nullable: bool| if nullable { "nullable" } else { "required" };
            steps.push(
                MigrationStep::new(
                    StepType::AlterNullability,
                    name,
                    position,
                    format!(
                        "make '{}' {} (was {})",
                        name,
                        state(new.nullable),
                        state(prev.nullable)
                    ),
                )
                .with_values(
                    Some(state(prev.nullable).to_string()),
                    Some(state(new.nullable).to_string()),
                )
                .with_column(new.clone()),
            );
        }

        steps
    }

    /// Reorder steps for surviving columns whose relative rank moved.
    /// Shifts caused only by additions or removals are not reorders.
    fn reorders(survivors: &[(&ColumnDescriptor, &ColumnDescriptor)]) -> Vec<MigrationStep> {
        let mut by_prev: Vec<_> = survivors.to_vec();
        by_prev.sort_by_key(|(prev, _)| prev.ordinal_position);
        let prev_rank: HashMap<&str, usize> = by_prev
            .iter()
            .enumerate()
            .map(|(rank, (_, new))| (new.name.as_str(), rank))
            .collect();

        let mut by_new: Vec<_> = survivors.to_vec();
        by_new.sort_by_key(|(_, new)| new.ordinal_position);

        by_new
            .iter()
            .enumerate()
            .filter(|(rank, (_, new))| prev_rank.get(new.name.as_str()) != Some(rank))
            .map(|(_, (prev, new))| {
                MigrationStep::new(
                    StepType::ReorderColumn,
                    &new.name,
                    new.ordinal_position,
                    format!(
                        "move '{}' from position {} to {}",
                        new.name, prev.ordinal_position, new.ordinal_position
                    ),
                )
                .with_values(
                    Some(prev.ordinal_position.to_string()),
                    Some(new.ordinal_position.to_string()),
                )
                .with_column((*new).clone())
            })
            .collect()
    }
}
