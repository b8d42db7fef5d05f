// ABOUTME: Reportable verification findings and the per-shard row counters
// ABOUTME: Every finding carries its table name so reporters need no extra context

use crate::datum::Datum;
use crate::dbtable::TableName;
use std::fmt;

/// Running row counts for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowStats {
    pub schema: String,
    pub table: String,
    /// Truth rows scanned.
    pub num_verified: u64,
    pub num_success: u64,
    /// Rows whose only differences were columns that could not be compared.
    pub num_conditional_success: u64,
    pub num_missing: u64,
    pub num_mismatch: u64,
    pub num_column_mismatch: u64,
    pub num_extraneous: u64,
    /// Rows handed to the live reverifier instead of being reported.
    pub num_live_retry: u64,
}

impl RowStats {
    pub fn for_table(name: &TableName) -> Self {
        Self {
            schema: name.schema.clone(),
            table: name.table.clone(),
            ..Default::default()
        }
    }

    /// Missing, mismatching or extraneous rows were seen.
    pub fn has_inconsistencies(&self) -> bool {
        self.num_missing > 0 || self.num_mismatch > 0 || self.num_extraneous > 0
    }

    /// Fold in outcomes settled after the scan, e.g. by the live reverifier.
    pub fn absorb_outcomes(&mut self, other: &RowStats) {
        self.num_success += other.num_success;
        self.num_conditional_success += other.num_conditional_success;
        self.num_missing += other.num_missing;
        self.num_mismatch += other.num_mismatch;
        self.num_column_mismatch += other.num_column_mismatch;
        self.num_extraneous += other.num_extraneous;
    }

    /// Sum of every counter, used for the run-wide summary.
    pub fn add(&mut self, other: &RowStats) {
        self.num_verified += other.num_verified;
        self.num_live_retry += other.num_live_retry;
        self.absorb_outcomes(other);
    }
}

impl fmt::Display for RowStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "truth rows seen: {}, success: {}, missing: {}, mismatch: {}, extraneous: {}, live_retry: {}",
            self.num_verified,
            self.num_success,
            self.num_missing,
            self.num_mismatch,
            self.num_extraneous,
            self.num_live_retry
        )
    }
}

/// A truth row with no counterpart on the target.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingRow {
    pub name: TableName,
    pub pk_columns: Vec<String>,
    pub pk_values: Vec<Datum>,
    pub columns: Vec<String>,
    pub values: Vec<Datum>,
}

/// A target row with no counterpart in the truth.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraneousRow {
    pub name: TableName,
    pub pk_columns: Vec<String>,
    pub pk_values: Vec<Datum>,
}

/// Same key on both sides, differing values.
#[derive(Debug, Clone, PartialEq)]
pub struct MismatchingRow {
    pub name: TableName,
    pub pk_columns: Vec<String>,
    pub pk_values: Vec<Datum>,
    pub mismatching_columns: Vec<String>,
    pub truth_vals: Vec<Datum>,
    pub target_vals: Vec<Datum>,
}

/// Same key on both sides, with columns whose values could not be compared.
#[derive(Debug, Clone, PartialEq)]
pub struct MismatchingColumn {
    pub name: TableName,
    pub pk_columns: Vec<String>,
    pub pk_values: Vec<Datum>,
    pub mismatching_columns: Vec<String>,
    pub truth_vals: Vec<Datum>,
    pub target_vals: Vec<Datum>,
    /// One `column (reason)` entry per column.
    pub info: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportableObject {
    MissingTable(TableName),
    ExtraneousTable(TableName),
    MismatchingTableDefinition { name: TableName, info: String },
    MissingRow(MissingRow),
    ExtraneousRow(ExtraneousRow),
    MismatchingRow(MismatchingRow),
    MismatchingColumn(MismatchingColumn),
    StatusReport { info: String },
    SummaryReport { info: String, stats: RowStats },
}

impl ReportableObject {
    /// Whether this object is a data or schema inconsistency rather than progress.
    pub fn is_inconsistency(&self) -> bool {
        !matches!(
            self,
            ReportableObject::StatusReport { .. } | ReportableObject::SummaryReport { .. }
        )
    }
}

/// Key values as display strings.
pub fn reportable_values(values: &[Datum]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_display() {
        let stats = RowStats {
            num_verified: 10,
            num_success: 6,
            num_missing: 1,
            num_mismatch: 2,
            num_extraneous: 1,
            num_live_retry: 3,
            ..Default::default()
        };
        assert_eq!(
            stats.to_string(),
            "truth rows seen: 10, success: 6, missing: 1, mismatch: 2, extraneous: 1, live_retry: 3"
        );
        assert!(stats.has_inconsistencies());
    }

    #[test]
    fn test_absorb_keeps_scan_counters() {
        let mut shard = RowStats {
            num_verified: 5,
            num_success: 3,
            num_live_retry: 2,
            ..Default::default()
        };
        let late = RowStats {
            num_verified: 99,
            num_success: 1,
            num_missing: 1,
            ..Default::default()
        };
        shard.absorb_outcomes(&late);
        assert_eq!(shard.num_verified, 5);
        assert_eq!(shard.num_success, 4);
        assert_eq!(shard.num_missing, 1);
        assert_eq!(shard.num_live_retry, 2);
    }

    #[test]
    fn test_clean_stats_are_consistent() {
        let stats = RowStats {
            num_verified: 4,
            num_success: 3,
            num_conditional_success: 1,
            num_column_mismatch: 1,
            ..Default::default()
        };
        assert!(!stats.has_inconsistencies());
    }
}
