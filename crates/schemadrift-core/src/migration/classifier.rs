//! Change classification.
//!
//! | Step | Classification |
//! |------|----------------|
//! | AddColumn, IncreasePrecision, AddIndex, AlterNullability, ReorderColumn | Safe |
//! | RemoveColumn, RenameColumn, ChangeType, ReduceSize, DropIndex | Breaking |

use super::error::Classification;
use super::plan::{MigrationStep, StepType};

/// Classifies migration steps with a fixed table.
pub struct ChangeClassifier;

impl ChangeClassifier {
    /// Classification of a step type.
    pub fn classify(step_type: StepType) -> Classification {
        match step_type {
            StepType::AddColumn
            | StepType::IncreasePrecision
            | StepType::AddIndex
            | StepType::AlterNullability
            | StepType::ReorderColumn => Classification::Safe,
            StepType::RemoveColumn
            | StepType::RenameColumn
            | StepType::ChangeType
            | StepType::ReduceSize
            | StepType::DropIndex => Classification::Breaking,
        }
    }

    /// Overall classification of a step list. Breaking iff any step is.
    pub fn classify_all(steps: &[MigrationStep]) -> Classification {
        steps
            .iter()
            .map(|s| s.classification)
            .max()
            .unwrap_or(Classification::Safe)
    }
}
