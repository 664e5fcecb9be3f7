use std::fmt;

use serde::Serialize;

use crate::finding::{Finding, FindingKind};

/// Phase of the audit state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read-only; produces findings.
    Check,
    /// Removes stale secondary data.
    Clean,
    /// Inserts missing secondary data.
    Heal,
}

impl Action {
    /// Log prefix of operations of this action.
    pub fn actor(&self) -> &'static str {
        match self {
            Action::Check => "Checker",
            Action::Clean => "Cleaner",
            Action::Heal => "Healer",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Check => "check",
            Action::Clean => "clean",
            Action::Heal => "heal",
        })
    }
}

/// Whether clean/heal operations mutate anything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Log what would change.
    #[default]
    DryRun,
    Execute,
}

/// Outcome of one operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub name: String,
    pub action: Action,
    pub dry_run: bool,
    /// Findings detected (check) or acted upon (clean/heal).
    pub findings: Vec<Finding>,
    /// Repairs actually applied.
    pub applied: usize,
}

impl OperationReport {
    pub fn success(&self) -> bool {
        self.action != Action::Check || self.findings.is_empty()
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }
}
