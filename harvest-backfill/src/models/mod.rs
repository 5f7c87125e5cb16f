//! Data models for discovery and backfill

pub mod descriptor;
pub mod run;
pub mod selection;

pub use descriptor::{
    dates_disagree, merge_descriptor, DateSource, DescriptorUpsert, ImportStatus, MergeResult,
    SessionDescriptor, Transition, DATE_DISAGREEMENT_DAYS,
};
pub use run::{BackfillRun, RunStatus};
pub use selection::{
    compare_for_order, rotate_after_cursor, sort_for_order, SelectionFilter, SelectionOrder,
};
