//! Extraction session: one decode pass over whole solid blocks.
//!
//! A session takes a set of requested indexes, widens it to every data
//! entry in front of them in their blocks, picks a [`Target`] per index once
//! (keep the requested ones, discard the rest), and drives the decoder
//! through a single pass. The decoder's per-index result codes are turned
//! into one [`Outcome`] per requested index.

use crate::archive::ArchiveHandle;
use crate::budget::ResourceManager;
use crate::credential::CredentialStore;
use crate::engine::{Decoder, EngineError, ExtractCallback, OperationResult, Target};
use crate::error::{ExtractionError, Failure};
use crate::types::BlockId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Largest up-front buffer allocation for a kept entry.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// Result of a session for one requested index.
#[derive(Debug, Clone)]
pub enum Outcome {
    Materialized(Arc<[u8]>),
    Failed(Failure),
}

impl Outcome {
    pub fn is_materialized(&self) -> bool {
        matches!(self, Outcome::Materialized(_))
    }

    pub fn into_result(self) -> Result<Arc<[u8]>, Failure> {
        match self {
            Outcome::Materialized(bytes) => Ok(bytes),
            Outcome::Failed(failure) => Err(failure),
        }
    }
}

/// Everything a finished session produced.
#[derive(Debug, Default)]
pub struct SessionReport {
    /// One outcome per requested index
    pub outcomes: BTreeMap<u32, Outcome>,

    /// Indexes handed to the decoder, ascending
    pub range: Vec<u32>,

    /// Whether the decoder was invoked at all
    pub decoded: bool,
}

impl SessionReport {
    pub fn outcome(&self, index: u32) -> Option<&Outcome> {
        self.outcomes.get(&index)
    }
}

/// Runs decode passes for one archive handle.
pub struct ExtractionSession<'a> {
    handle: &'a ArchiveHandle,
    resources: &'a Arc<ResourceManager>,
    reservation_bytes: u64,
}

impl<'a> ExtractionSession<'a> {
    pub fn new(
        handle: &'a ArchiveHandle,
        resources: &'a Arc<ResourceManager>,
        reservation_bytes: u64,
    ) -> Self {
        Self {
            handle,
            resources,
            reservation_bytes,
        }
    }

    /// Locks the handle's decoder and runs one pass for `requested`.
    pub fn run(&self, requested: &BTreeSet<u32>) -> SessionReport {
        let mut decoder = self.handle.lock_decoder();
        self.run_locked(decoder.as_mut(), requested)
    }

    /// Runs one pass with a decoder the caller already holds exclusively.
    pub(crate) fn run_locked(
        &self,
        decoder: &mut dyn Decoder,
        requested: &BTreeSet<u32>,
    ) -> SessionReport {
        let _reservation = self.resources.reserve(self.reservation_bytes);
        let mut report = SessionReport::default();

        if self.handle.is_cancelled() {
            report.outcomes = requested
                .iter()
                .map(|&i| (i, Outcome::Failed(Failure::Cancelled)))
                .collect();
            return report;
        }

        let mut wanted = BTreeSet::new();
        for &index in requested {
            match self.handle.entry(index) {
                None => {
                    report
                        .outcomes
                        .insert(index, Outcome::Failed(ExtractionError::Unavailable.into()));
                }
                Some(entry) if !entry.has_data() => {
                    report
                        .outcomes
                        .insert(index, Outcome::Materialized(Arc::from(Vec::new())));
                }
                Some(_) => {
                    wanted.insert(index);
                }
            }
        }
        if wanted.is_empty() {
            return report;
        }

        report.range = self.covering_range(&wanted);
        let targets = report
            .range
            .iter()
            .map(|&index| {
                let target = if wanted.contains(&index) {
                    let size = self.handle.entry(index).map_or(0, |e| e.size);
                    Target::Keep(Vec::with_capacity(size.min(MAX_PREALLOCATION) as usize))
                } else {
                    Target::Discard
                };
                (index, target)
            })
            .collect();

        tracing::debug!(
            requested = ?wanted,
            range = report.range.len(),
            "starting extraction session"
        );

        let mut callback = SessionCallback {
            targets,
            results: BTreeMap::new(),
            credentials: self.handle.credentials(),
            cancelled: self.handle.cancel_flag(),
            asked_password: false,
        };
        let pass = decoder.extract(&report.range, &mut callback);
        report.decoded = true;

        let cancelled = self.handle.is_cancelled() || matches!(pass, Err(EngineError::Aborted));
        let pass_failure = match pass {
            Ok(()) => callback
                .results
                .values()
                .find(|code| code.is_pass_fatal())
                .and_then(|code| code.failure()),
            Err(err) => Some(err.into_failure()),
        };

        for &index in &wanted {
            let outcome = if cancelled {
                Outcome::Failed(Failure::Cancelled)
            } else {
                self.settle(index, &mut callback, pass_failure.as_ref())
            };
            report.outcomes.insert(index, outcome);
        }

        if callback.asked_password {
            self.update_credentials(&report);
        }

        tracing::debug!(
            materialized = report.outcomes.values().filter(|o| o.is_materialized()).count(),
            failed = report.outcomes.values().filter(|o| !o.is_materialized()).count(),
            "extraction session finished"
        );
        report
    }

    /// Every data entry in the requested blocks up to the last requested one.
    fn covering_range(&self, wanted: &BTreeSet<u32>) -> Vec<u32> {
        let mut last_in_block: BTreeMap<BlockId, u32> = BTreeMap::new();
        for &index in wanted {
            if let Some(block) = self.handle.entry(index).and_then(|e| e.block) {
                let last = last_in_block.entry(block).or_insert(index);
                *last = (*last).max(index);
            }
        }

        let mut range: Vec<u32> = last_in_block
            .iter()
            .flat_map(|(&block, &last)| {
                self.handle
                    .block_members(block)
                    .iter()
                    .copied()
                    .take_while(move |&member| member <= last)
            })
            .collect();
        range.sort_unstable();
        range.dedup();
        range
    }

    fn settle(
        &self,
        index: u32,
        callback: &mut SessionCallback<'_>,
        pass_failure: Option<&Failure>,
    ) -> Outcome {
        match callback.results.get(&index) {
            Some(OperationResult::Ok) => {
                let bytes = match callback.targets.remove(&index) {
                    Some(Target::Keep(bytes)) => bytes,
                    _ => Vec::new(),
                };
                let expected = self.handle.entry(index).map_or(0, |e| e.size);
                let actual = bytes.len() as u64;
                if actual < expected {
                    Outcome::Failed(ExtractionError::UnexpectedEnd.into())
                } else if actual > expected {
                    Outcome::Failed(ExtractionError::TrailingData.into())
                } else {
                    Outcome::Materialized(Arc::from(bytes))
                }
            }
            Some(code) => Outcome::Failed(
                code.failure()
                    .unwrap_or_else(|| ExtractionError::Unavailable.into()),
            ),
            None => Outcome::Failed(
                pass_failure
                    .cloned()
                    .unwrap_or_else(|| ExtractionError::Unavailable.into()),
            ),
        }
    }

    fn update_credentials(&self, report: &SessionReport) {
        let credentials = self.handle.credentials();
        let mut unlocked = false;
        let mut rejected = false;
        for (&index, outcome) in &report.outcomes {
            if !self.handle.entry(index).is_some_and(|e| e.encrypted) {
                continue;
            }
            match outcome {
                Outcome::Materialized(_) => unlocked = true,
                Outcome::Failed(Failure::WrongPassword) => rejected = true,
                Outcome::Failed(_) => {}
            }
        }

        if unlocked {
            credentials.confirm();
        } else if rejected {
            tracing::warn!(archive = %self.handle.path().display(), "archive password rejected");
            credentials.reject();
        }
    }
}

/// Session side of the decoder conversation.
struct SessionCallback<'a> {
    targets: BTreeMap<u32, Target>,
    results: BTreeMap<u32, OperationResult>,
    credentials: &'a CredentialStore,
    cancelled: Arc<AtomicBool>,
    asked_password: bool,
}

impl ExtractCallback for SessionCallback<'_> {
    fn target(&mut self, index: u32) -> &mut Target {
        // Indexes outside the planned range are decoded through and dropped.
        self.targets.entry(index).or_insert(Target::Discard)
    }

    fn set_operation_result(&mut self, index: u32, result: OperationResult) {
        if result != OperationResult::Ok {
            tracing::debug!(index, ?result, "entry failed to decode");
        }
        self.results.insert(index, result);
    }

    fn password(&mut self) -> Option<String> {
        self.asked_password = true;
        self.credentials.obtain()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
