//! Discovery, orchestration and their external collaborators
//!
//! - `portal_client` / `importer` / `notifier`: trait seams plus HTTP implementations
//! - `normalize`: raw listing row to descriptor upsert
//! - `discoverer`: paged listing walk into the store
//! - `orchestrator`: runs, resume, retry-failed
//! - `operator`: per-descriptor and per-run operator commands

pub mod discoverer;
mod http;
pub mod importer;
pub mod normalize;
pub mod notifier;
pub mod operator;
pub mod orchestrator;
pub mod portal_client;

pub use discoverer::{DiscoveryFilters, DiscoveryReport, SessionDiscoverer, StopReason};
pub use importer::{HttpImporter, ImportError, Importer};
pub use normalize::{normalize, NormalizeError};
pub use notifier::{LogNotifier, Notifier, NotifyError, RunEvent, RunSummary, WebhookNotifier};
pub use operator::{OperatorCommands, ReviewItem, StatusReport};
pub use orchestrator::{BackfillOrchestrator, DryRunPlan, RunOutcome};
pub use portal_client::{HttpPortalClient, PortalClient, PortalError, PortalPage, RawDescriptor};
