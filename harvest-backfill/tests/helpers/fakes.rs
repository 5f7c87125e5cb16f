//! Scripted collaborators
//!
//! Every fake records its calls with `tokio::time::Instant`, so tests running
//! under a paused clock can assert exact spacing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use harvest_backfill::services::{
    ImportError, Importer, Notifier, NotifyError, PortalClient, PortalError, PortalPage,
    RawDescriptor, RunEvent,
};

/// Listing row with a bare id, key and optional date header
pub fn raw(report_id: &str, date_context: Option<&str>) -> RawDescriptor {
    RawDescriptor {
        raw_id_or_url: report_id.to_string(),
        access_key: Some(format!("key-{}", report_id)),
        display_text: Some(format!("Session {}", report_id)),
        date_context_text: date_context.map(str::to_string),
        tags: Vec::new(),
    }
}

/// Portal serving fixed pages; page `n` is requested with token `page-n`
pub struct ScriptedPortal {
    pages: Vec<Vec<RawDescriptor>>,
    failures: Mutex<HashMap<usize, VecDeque<PortalError>>>,
    calls: Mutex<Vec<(Option<String>, Instant)>>,
    stuck_at: Option<usize>,
}

impl ScriptedPortal {
    pub fn new(pages: Vec<Vec<RawDescriptor>>) -> Self {
        Self {
            pages,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            stuck_at: None,
        }
    }

    /// Page `index` names itself as the next page, forever
    pub fn stuck_at(mut self, index: usize) -> Self {
        self.stuck_at = Some(index);
        self
    }

    /// Page `index` returns these errors (in order) before succeeding
    pub fn failing_page(self, index: usize, errors: Vec<PortalError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry(index)
            .or_default()
            .extend(errors);
        self
    }

    /// Page tokens requested, in call order
    pub fn requested(&self) -> Vec<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(token, _)| token.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl PortalClient for ScriptedPortal {
    async fn fetch_page(&self, page_token: Option<&str>) -> Result<PortalPage, PortalError> {
        self.calls
            .lock()
            .unwrap()
            .push((page_token.map(str::to_string), Instant::now()));

        let index = match page_token {
            None => 0,
            Some(token) => token
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| PortalError::Permanent(format!("bad page token {}", token)))?,
        };

        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&index)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let descriptors = self
            .pages
            .get(index)
            .cloned()
            .ok_or_else(|| PortalError::Permanent(format!("no page {}", index)))?;
        let next_page_token = if self.stuck_at == Some(index) {
            Some(format!("page-{}", index))
        } else {
            (index + 1 < self.pages.len()).then(|| format!("page-{}", index + 1))
        };

        Ok(PortalPage {
            descriptors,
            next_page_token,
        })
    }
}

/// One importer invocation
#[derive(Debug, Clone)]
pub struct ImportCall {
    pub report_id: String,
    pub access_key: String,
    pub at: Instant,
}

/// Importer answering from per-session scripts; unscripted sessions import 10 records
#[derive(Default)]
pub struct ScriptedImporter {
    scripts: Mutex<HashMap<String, VecDeque<Result<u64, ImportError>>>>,
    persistent: Mutex<HashMap<String, ImportError>>,
    calls: Mutex<Vec<ImportCall>>,
    hang_at: Mutex<Option<(usize, Arc<Notify>)>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next calls for `report_id` in order, then fall back
    pub fn script(self, report_id: &str, results: Vec<Result<u64, ImportError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(report_id.to_string())
            .or_default()
            .extend(results);
        self
    }

    /// Every unscripted call for `report_id` fails with `error`
    pub fn always_fail(self, report_id: &str, error: ImportError) -> Self {
        self.persistent
            .lock()
            .unwrap()
            .insert(report_id.to_string(), error);
        self
    }

    /// The `n`-th call (1-based) signals the returned handle and never returns
    pub fn hang_at_call(&self, n: usize) -> Arc<Notify> {
        let reached = Arc::new(Notify::new());
        *self.hang_at.lock().unwrap() = Some((n, reached.clone()));
        reached
    }

    /// Cancel `token` as the `n`-th call (1-based) returns
    pub fn cancel_after_call(&self, n: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((n, token));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.report_id.clone())
            .collect()
    }

    pub fn call_log(&self) -> Vec<ImportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_times(&self, report_id: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.report_id == report_id)
            .map(|c| c.at)
            .collect()
    }
}

#[async_trait]
impl Importer for ScriptedImporter {
    async fn import_session(&self, report_id: &str, access_key: &str) -> Result<u64, ImportError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ImportCall {
                report_id: report_id.to_string(),
                access_key: access_key.to_string(),
                at: Instant::now(),
            });
            calls.len()
        };

        let hang = match &*self.hang_at.lock().unwrap() {
            Some((n, reached)) if *n == call_number => Some(reached.clone()),
            _ => None,
        };
        if let Some(reached) = hang {
            reached.notify_one();
            std::future::pending::<()>().await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(report_id)
            .and_then(VecDeque::pop_front);
        let result = match scripted {
            Some(result) => result,
            None => match self.persistent.lock().unwrap().get(report_id) {
                Some(error) => Err(error.clone()),
                None => Ok(10),
            },
        };

        if let Some((n, token)) = &*self.cancel_after.lock().unwrap() {
            if *n == call_number {
                token.cancel();
            }
        }

        result
    }
}

/// Keeps every run event it receives
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(RunEvent::name).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &RunEvent) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
