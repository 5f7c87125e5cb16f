//! Which pending descriptors a run picks up, and in what order

use super::descriptor::SessionDescriptor;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Processing order of selected descriptors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Row filter shared by selection, bulk retry and status queries
///
/// Empty sets mean "no restriction". A date range excludes undated rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionFilter {
    #[serde(default)]
    pub date_start: Option<NaiveDate>,
    #[serde(default)]
    pub date_end: Option<NaiveDate>,
    /// Match descriptors carrying any of these tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Restrict to an explicit id set (retry-failed runs)
    #[serde(default)]
    pub report_ids: Option<BTreeSet<String>>,
}

impl SelectionFilter {
    pub fn matches(&self, descriptor: &SessionDescriptor) -> bool {
        if self.date_start.is_some() || self.date_end.is_some() {
            let Some(date) = descriptor.session_date else {
                return false;
            };
            if self.date_start.is_some_and(|start| date < start) {
                return false;
            }
            if self.date_end.is_some_and(|end| date > end) {
                return false;
            }
        }

        if !self.tags.is_empty() && !descriptor.has_any_tag(&self.tags) {
            return false;
        }

        if let Some(ids) = &self.report_ids {
            if !ids.contains(&descriptor.report_id) {
                return false;
            }
        }

        true
    }
}

/// Total order used for selection: dated rows by date (direction per `order`),
/// undated rows last, ties broken by report id in the same direction.
pub fn compare_for_order(
    order: SelectionOrder,
    a: &SessionDescriptor,
    b: &SessionDescriptor,
) -> Ordering {
    let by_date = match (a.session_date, b.session_date) {
        (Some(x), Some(y)) => match order {
            SelectionOrder::OldestFirst => x.cmp(&y),
            SelectionOrder::NewestFirst => y.cmp(&x),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };

    by_date.then_with(|| match order {
        SelectionOrder::OldestFirst => a.report_id.cmp(&b.report_id),
        SelectionOrder::NewestFirst => b.report_id.cmp(&a.report_id),
    })
}

/// Sort descriptors in place per `order`
pub fn sort_for_order(order: SelectionOrder, descriptors: &mut [SessionDescriptor]) {
    descriptors.sort_by(|a, b| compare_for_order(order, a, b));
}

/// Rotate an ordered list so that rows strictly after `cursor` come first,
/// followed by rows at or before it (requeued retries from an earlier pass).
pub fn rotate_after_cursor(
    order: SelectionOrder,
    descriptors: Vec<SessionDescriptor>,
    cursor: &SessionDescriptor,
) -> Vec<SessionDescriptor> {
    let (before, after): (Vec<_>, Vec<_>) = descriptors
        .into_iter()
        .partition(|d| compare_for_order(order, d, cursor) != Ordering::Greater);

    after.into_iter().chain(before).collect()
}
