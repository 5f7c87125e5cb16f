//! Candidate selection for a run

use super::DryRunPlan;
use crate::config::RunConfig;
use crate::error::BackfillResult;
use crate::models::{sort_for_order, SessionDescriptor};
use crate::store::DiscoveryStore;

/// Pending rows matching the run filter, sorted, optionally capped
///
/// Returns the queue and the match count before the cap.
pub(super) async fn select(
    store: &dyn DiscoveryStore,
    config: &RunConfig,
    apply_cap: bool,
) -> BackfillResult<(Vec<SessionDescriptor>, usize)> {
    let mut candidates = store.select_candidates(&config.filter).await?;
    sort_for_order(config.order, &mut candidates);
    let matched = candidates.len();

    if apply_cap {
        if let Some(max) = config.max_sessions_per_run {
            candidates.truncate(usize::try_from(max).unwrap_or(usize::MAX));
        }
    }

    tracing::debug!(
        matched,
        selected = candidates.len(),
        "Selected pending descriptors"
    );
    Ok((candidates, matched))
}

pub(super) async fn plan(store: &dyn DiscoveryStore, config: &RunConfig) -> BackfillResult<DryRunPlan> {
    let (descriptors, matched) = select(store, config, true).await?;
    Ok(DryRunPlan {
        descriptors,
        matched,
    })
}

/// Trim a resumed queue to the run's remaining budget
///
/// Rows this run already touched (requeued retries, recovered in-flight
/// rows) are kept first; the rest of the budget goes to other pending rows
/// in queue order. Relative order is preserved.
pub(super) fn fill_remaining_budget(
    queue: Vec<SessionDescriptor>,
    run_id: &str,
    remaining: usize,
) -> Vec<SessionDescriptor> {
    let touched = queue
        .iter()
        .filter(|d| d.last_run_id.as_deref() == Some(run_id))
        .count();
    let mut fresh_budget = remaining.saturating_sub(touched);

    queue
        .into_iter()
        .filter(|d| {
            if d.last_run_id.as_deref() == Some(run_id) {
                true
            } else if fresh_budget > 0 {
                fresh_budget -= 1;
                true
            } else {
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DateSource, DescriptorUpsert};
    use chrono::Utc;

    fn row(id: &str, last_run_id: Option<&str>) -> SessionDescriptor {
        let incoming = DescriptorUpsert {
            report_id: id.into(),
            access_key: "k".into(),
            date_source: DateSource::None,
            ..DescriptorUpsert::default()
        };
        let mut descriptor = SessionDescriptor::from_upsert(&incoming, Utc::now());
        descriptor.last_run_id = last_run_id.map(str::to_string);
        descriptor
    }

    fn ids(rows: &[SessionDescriptor]) -> Vec<&str> {
        rows.iter().map(|d| d.report_id.as_str()).collect()
    }

    #[test]
    fn test_budget_keeps_touched_rows_then_fills() {
        let queue = vec![
            row("A", None),
            row("B", Some("run-1")),
            row("C", None),
            row("D", Some("run-1")),
        ];

        let kept = fill_remaining_budget(queue, "run-1", 3);
        assert_eq!(ids(&kept), vec!["A", "B", "D"]);
    }

    #[test]
    fn test_budget_smaller_than_touched_keeps_all_touched() {
        let queue = vec![row("A", None), row("B", Some("run-1")), row("C", Some("run-1"))];

        let kept = fill_remaining_budget(queue, "run-1", 1);
        assert_eq!(ids(&kept), vec!["B", "C"]);
    }

    #[test]
    fn test_rows_from_other_runs_count_as_fresh() {
        let queue = vec![row("A", Some("run-0")), row("B", None)];

        let kept = fill_remaining_budget(queue, "run-1", 1);
        assert_eq!(ids(&kept), vec!["A"]);
    }
}
