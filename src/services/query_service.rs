//! # Query Service
//!
//! Read side of the pipeline: batch reports through a read-through cache, and live
//! progress.
//!
//! `get_report` looks in the shared store first, then the report table, and finally
//! projects a new report from the batch itself. Concurrent callers for the same batch are
//! coalesced so a cold key costs one database round trip regardless of fan-in. A cache
//! outage degrades to a miss; it never fails the request.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::coalescer::RequestCoalescer;
use crate::barrier::CompletionBarrier;
use crate::domain::{BatchProgress, BatchStatus, Report};
use crate::error::{ArgusError, ArgusResult};
use crate::repository::{BatchRepository, ReportRepository};
use crate::store::SharedStoreProvider;

pub fn report_cache_key(batch_id: Uuid) -> String {
    format!("report:{batch_id}")
}

/// Everything one uncoalesced report fetch needs, owned so it can run as a shared future.
#[derive(Clone)]
struct ReportLoader {
    batches: Arc<dyn BatchRepository>,
    reports: Arc<dyn ReportRepository>,
    cache: SharedStoreProvider,
    ttl: Duration,
}

impl ReportLoader {
    async fn load(self, batch_id: Uuid) -> ArgusResult<Report> {
        if let Some(report) = self.from_cache(batch_id).await {
            debug!(batch_id = %batch_id, "Report cache hit");
            return Ok(report);
        }

        debug!(batch_id = %batch_id, "Report cache miss, querying database");
        let report = self.from_database(batch_id).await?;
        self.store_in_cache(&report).await;
        Ok(report)
    }

    async fn from_cache(&self, batch_id: Uuid) -> Option<Report> {
        let key = report_cache_key(batch_id);
        let raw = match self.cache.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Report cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Discarding undecodable cached report");
                None
            }
        }
    }

    async fn from_database(&self, batch_id: Uuid) -> ArgusResult<Report> {
        if let Some(report) = self.reports.find_by_batch_id(batch_id).await? {
            return Ok(report);
        }

        let batch = self
            .batches
            .find_by_id(batch_id)
            .await?
            .ok_or(ArgusError::NotFound(batch_id))?;
        let report = Report::from_batch(&batch);

        if let Err(e) = self.reports.save(&report).await {
            warn!(batch_id = %batch_id, error = %e, "Failed to persist projected report");
        }
        Ok(report)
    }

    async fn store_in_cache(&self, report: &Report) {
        let payload = match serde_json::to_string(report) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(batch_id = %report.batch_id, error = %e, "Failed to encode report");
                return;
            }
        };
        if let Err(e) = self
            .cache
            .set_with_ttl(&report_cache_key(report.batch_id), &payload, self.ttl)
            .await
        {
            warn!(batch_id = %report.batch_id, error = %e, "Report cache write failed");
        }
    }
}

pub struct QueryService {
    loader: ReportLoader,
    barrier: CompletionBarrier,
    coalescer: RequestCoalescer<Uuid, Report>,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("report_ttl", &self.loader.ttl)
            .field("coalescer", &self.coalescer)
            .finish_non_exhaustive()
    }
}

impl QueryService {
    pub fn new(
        batches: Arc<dyn BatchRepository>,
        reports: Arc<dyn ReportRepository>,
        cache: SharedStoreProvider,
        barrier: CompletionBarrier,
        report_ttl: Duration,
    ) -> Self {
        Self {
            loader: ReportLoader {
                batches,
                reports,
                cache,
                ttl: report_ttl,
            },
            barrier,
            coalescer: RequestCoalescer::new(),
        }
    }

    /// Report for `batch_id` and whether it came from another caller's in-flight fetch.
    pub async fn get_report(&self, batch_id: Uuid) -> ArgusResult<(Report, bool)> {
        let loader = self.loader.clone();
        let (result, shared) = self
            .coalescer
            .run(batch_id, move || loader.load(batch_id))
            .await;

        if shared {
            info!(batch_id = %batch_id, "🤝 Report request coalesced with in-flight fetch");
        }
        result.map(|report| (report, shared))
    }

    /// Live progress. While scattering, the barrier count is the freshest processed figure.
    pub async fn get_progress(&self, batch_id: Uuid) -> ArgusResult<BatchProgress> {
        let batch = self
            .loader
            .batches
            .find_by_id(batch_id)
            .await?
            .ok_or(ArgusError::NotFound(batch_id))?;

        let mut processed = batch.processed_files;
        if batch.status == BatchStatus::Scattering {
            match self.barrier.count(batch_id).await {
                Ok(count) => {
                    processed = processed.max(u32::try_from(count).unwrap_or(u32::MAX));
                }
                Err(e) => {
                    warn!(batch_id = %batch_id, error = %e, "Barrier unavailable for progress");
                }
            }
        }

        Ok(BatchProgress::new(&batch, processed))
    }

    /// Drop the cached report so the next read goes to the database.
    pub async fn invalidate_report(&self, batch_id: Uuid) -> ArgusResult<()> {
        self.loader
            .cache
            .delete(&report_cache_key(batch_id))
            .await?;
        debug!(batch_id = %batch_id, "Report cache invalidated");
        Ok(())
    }
}
