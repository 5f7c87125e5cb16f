//! Session descriptor and its import state machine
//!
//! ```text
//! pending --Begin--> importing
//! importing --Succeed--> imported                      [terminal]
//! importing --Requeue--> pending                       (failed, retries remain)
//! importing --GiveUp--> needs_review                   [terminal]
//! importing --Release/Recover--> pending               (no importer call / crash)
//! pending | needs_review --Retry--> pending            (operator)
//! pending | importing | needs_review --Skip--> skipped [terminal]
//! any but importing --Reset--> pending                 (operator)
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Two dates further apart than this are flagged instead of silently reconciled
pub const DATE_DISAGREEMENT_DAYS: i64 = 3;

/// Import lifecycle of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    /// Discovered, waiting for an import attempt
    Pending,
    /// Import in flight (persisted before the importer is called)
    Importing,
    /// Records landed locally
    Imported,
    /// Retries exhausted, operator decision required
    NeedsReview,
    /// Operator chose not to import
    Skipped,
}

impl ImportStatus {
    pub const ALL: [ImportStatus; 5] = [
        ImportStatus::Pending,
        ImportStatus::Importing,
        ImportStatus::Imported,
        ImportStatus::NeedsReview,
        ImportStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Importing => "importing",
            ImportStatus::Imported => "imported",
            ImportStatus::NeedsReview => "needs_review",
            ImportStatus::Skipped => "skipped",
        }
    }

    /// Terminal states are never left without an explicit operator call
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportStatus::Imported | ImportStatus::NeedsReview | ImportStatus::Skipped
        )
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImportStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown import status '{}'", s))
    }
}

/// A state-machine edge; the only way a descriptor's status changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Selected by the orchestrator, importer about to be called
    Begin,
    /// Importer returned a record count
    Succeed,
    /// Importer failed, retries remain
    Requeue,
    /// Importer failed, retries exhausted
    GiveUp,
    /// Cancelled while waiting for a rate-limit token; importer never called
    Release,
    /// Left `importing` by a crashed process
    Recover,
    /// Operator retry request
    Retry,
    /// Operator skip request
    Skip,
    /// Operator reset, the only way out of `imported` / `skipped`
    Reset,
}

impl Transition {
    pub fn allowed_from(&self) -> &'static [ImportStatus] {
        use ImportStatus::*;
        match self {
            Transition::Begin => &[Pending],
            Transition::Succeed
            | Transition::Requeue
            | Transition::GiveUp
            | Transition::Release
            | Transition::Recover => &[Importing],
            Transition::Retry => &[Pending, NeedsReview],
            Transition::Skip => &[Pending, Importing, NeedsReview],
            Transition::Reset => &[Pending, Imported, NeedsReview, Skipped],
        }
    }

    pub fn target(&self) -> ImportStatus {
        match self {
            Transition::Begin => ImportStatus::Importing,
            Transition::Succeed => ImportStatus::Imported,
            Transition::GiveUp => ImportStatus::NeedsReview,
            Transition::Skip => ImportStatus::Skipped,
            Transition::Requeue
            | Transition::Release
            | Transition::Recover
            | Transition::Retry
            | Transition::Reset => ImportStatus::Pending,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::Begin => "begin",
            Transition::Succeed => "succeed",
            Transition::Requeue => "requeue",
            Transition::GiveUp => "give up",
            Transition::Release => "release",
            Transition::Recover => "recover",
            Transition::Retry => "retry",
            Transition::Skip => "skip",
            Transition::Reset => "reset",
        }
    }

    pub fn permits(&self, from: ImportStatus) -> bool {
        self.allowed_from().contains(&from)
    }

    /// SQL list literal of the allowed source states, e.g. `('pending','needs_review')`
    pub fn allowed_from_sql(&self) -> String {
        let states: Vec<String> = self
            .allowed_from()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        format!("({})", states.join(", "))
    }
}

/// Where a session date came from
///
/// `report_detail` dates may reflect the day the detail page was viewed rather
/// than the session itself, so they rank below listing dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateSource {
    Listing,
    ReportDetail,
    Manual,
    #[default]
    None,
}

impl DateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateSource::Listing => "listing",
            DateSource::ReportDetail => "report_detail",
            DateSource::Manual => "manual",
            DateSource::None => "none",
        }
    }

    /// Higher wins: manual > listing > report_detail > none
    pub fn reliability(&self) -> u8 {
        match self {
            DateSource::Manual => 3,
            DateSource::Listing => 2,
            DateSource::ReportDetail => 1,
            DateSource::None => 0,
        }
    }
}

impl fmt::Display for DateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DateSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "listing" => Ok(DateSource::Listing),
            "report_detail" => Ok(DateSource::ReportDetail),
            "manual" => Ok(DateSource::Manual),
            "none" => Ok(DateSource::None),
            other => Err(format!("unknown date source '{}'", other)),
        }
    }
}

/// One externally discoverable session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub report_id: String,
    pub access_key: String,
    pub display_name: Option<String>,
    pub session_date: Option<NaiveDate>,
    pub date_source: DateSource,
    /// Two date sources disagreed by more than [`DATE_DISAGREEMENT_DAYS`]
    pub date_flagged: bool,
    pub tags: BTreeSet<String>,
    pub import_status: ImportStatus,
    pub record_count_actual: Option<i64>,
    /// Importer invocations so far (successful or not)
    pub attempt_count: i64,
    pub last_error: Option<String>,
    /// Run that most recently began importing this descriptor
    pub last_run_id: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub import_completed_at: Option<DateTime<Utc>>,
}

impl SessionDescriptor {
    /// Build a fresh `pending` row from a normalized discovery result
    pub fn from_upsert(incoming: &DescriptorUpsert, now: DateTime<Utc>) -> Self {
        let (session_date, date_source) = match incoming.session_date {
            Some(date) => (Some(date), incoming.date_source),
            None => (None, DateSource::None),
        };

        Self {
            report_id: incoming.report_id.clone(),
            access_key: incoming.access_key.clone(),
            display_name: incoming.display_name.clone(),
            session_date,
            date_source,
            date_flagged: incoming.date_flagged,
            tags: incoming.tags.clone(),
            import_status: ImportStatus::Pending,
            record_count_actual: None,
            attempt_count: 0,
            last_error: None,
            last_run_id: None,
            discovered_at: now,
            updated_at: now,
            import_completed_at: None,
        }
    }

    pub fn has_any_tag(&self, wanted: &BTreeSet<String>) -> bool {
        wanted.iter().any(|tag| self.tags.contains(tag))
    }
}

/// Normalized descriptor as produced by discovery (or a manual date edit)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DescriptorUpsert {
    pub report_id: String,
    pub access_key: String,
    pub display_name: Option<String>,
    pub session_date: Option<NaiveDate>,
    pub date_source: DateSource,
    pub date_flagged: bool,
    pub tags: BTreeSet<String>,
}

/// Result of folding an incoming descriptor into an existing row
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub descriptor: SessionDescriptor,
    pub changed: bool,
}

/// True when two dates are further apart than [`DATE_DISAGREEMENT_DAYS`]
pub fn dates_disagree(a: NaiveDate, b: NaiveDate) -> bool {
    (a - b).num_days().abs() > DATE_DISAGREEMENT_DAYS
}

/// Merge discovery output into an existing row
///
/// Import lifecycle columns are never touched here. An incoming date replaces
/// the stored one only when the stored source is less reliable, or when both
/// are manual. A missing incoming date never clears a stored one.
pub fn merge_descriptor(
    existing: &SessionDescriptor,
    incoming: &DescriptorUpsert,
    now: DateTime<Utc>,
) -> MergeResult {
    let mut merged = existing.clone();

    let access_key = incoming.access_key.trim();
    if !access_key.is_empty() && access_key != merged.access_key {
        merged.access_key = access_key.to_string();
    }

    if let Some(name) = incoming.display_name.as_ref().filter(|n| !n.trim().is_empty()) {
        if merged.display_name.as_ref() != Some(name) {
            merged.display_name = Some(name.clone());
        }
    }

    if let Some(incoming_date) = incoming.session_date {
        match merged.session_date {
            None => {
                merged.session_date = Some(incoming_date);
                merged.date_source = incoming.date_source;
            }
            Some(current) if current != incoming_date => {
                let incoming_rank = incoming.date_source.reliability();
                let stored_rank = merged.date_source.reliability();
                let replaces = incoming_rank > stored_rank
                    || (incoming_rank == stored_rank && incoming.date_source == DateSource::Manual);

                // Same non-manual source, two answers: keep the first, flag for review
                let same_rank_conflict = incoming_rank == stored_rank && !replaces;
                if same_rank_conflict || dates_disagree(current, incoming_date) {
                    merged.date_flagged = true;
                }
                if replaces {
                    merged.session_date = Some(incoming_date);
                    merged.date_source = incoming.date_source;
                }
            }
            Some(_) => {}
        }
    }

    if incoming.date_flagged {
        merged.date_flagged = true;
    }

    merged.tags.extend(incoming.tags.iter().cloned());

    let changed = merged != *existing;
    if changed {
        merged.updated_at = now;
    }

    MergeResult {
        descriptor: merged,
        changed,
    }
}
