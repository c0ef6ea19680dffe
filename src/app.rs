use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::dailymed::DailyMedClient;
use crate::error::LyoError;
use crate::feed::{ApprovalFeedClient, FeedLoader, load_results};
use crate::ingredients::{ExtractionScope, ExtractionSummary, IngredientExtractor, extract_into_store};
use crate::labels::{
    CopySummary, LabelResolver, LabelStageSummary, ResolveScope, copy_lyophilized,
    resolve_into_store,
};
use crate::normalize::{NormalizeSummary, store_approvals};
use crate::reconcile::{CorrectionSummary, ReconcileScanner, apply_corrections, find_corrections};
use crate::retry::RetryPolicy;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Approvals,
    Labels,
    Ingredients,
    Reconcile,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Approvals => "approvals",
            Stage::Labels => "labels",
            Stage::Ingredients => "ingredients",
            Stage::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_download: bool,
    pub scope: ResolveScope,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalsResult {
    pub payload: String,
    pub summary: NormalizeSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelsResult {
    pub resolution: LabelStageSummary,
    pub copy: CopySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    pub scraped: usize,
    pub corrections: BTreeMap<String, Vec<String>>,
    pub applied: CorrectionSummary,
    pub extraction: ExtractionSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub approvals: ApprovalsResult,
    pub labels: LabelsResult,
    pub ingredients: ExtractionSummary,
    pub reconcile: ReconcileResult,
}

/// Runs the ingestion stages against one store handle.
pub struct Pipeline<'a, F: ApprovalFeedClient, D: DailyMedClient> {
    store: &'a Store,
    config: &'a ResolvedConfig,
    feed: F,
    dailymed: D,
    page_retry: RetryPolicy,
}

impl<'a, F: ApprovalFeedClient, D: DailyMedClient> Pipeline<'a, F, D> {
    pub fn new(store: &'a Store, config: &'a ResolvedConfig, feed: F, dailymed: D) -> Self {
        Self {
            store,
            config,
            feed,
            dailymed,
            page_retry: RetryPolicy::http(),
        }
    }

    /// Retry policy for reconciliation search pages.
    pub fn with_page_retry(mut self, retry: RetryPolicy) -> Self {
        self.page_retry = retry;
        self
    }

    pub fn run(&self, options: RunOptions, sink: &dyn ProgressSink) -> Result<RunResult, LyoError> {
        let approvals = self.approvals(options.skip_download, sink)?;
        let labels = self.labels(options.scope, sink)?;
        let ingredients = self.ingredients(sink)?;
        let reconcile = self.reconcile(sink)?;
        Ok(RunResult {
            approvals,
            labels,
            ingredients,
            reconcile,
        })
    }

    pub fn approvals(
        &self,
        skip_download: bool,
        sink: &dyn ProgressSink,
    ) -> Result<ApprovalsResult, LyoError> {
        let started = Instant::now();
        emit(sink, Stage::Approvals, "staging approval feed", None);
        let loader = FeedLoader::new(
            &self.feed,
            &self.config.urls.fda_drugs_data,
            &self.config.staging_dir,
        );
        let payload = loader.prepare(skip_download)?;
        let approvals = load_results(&payload)?;

        emit(
            sink,
            Stage::Approvals,
            format!("normalizing {} approval records", approvals.len()),
            Some(started.elapsed()),
        );
        let summary = store_approvals(self.store, &approvals, self.config.batch.approvals)?;
        emit(
            sink,
            Stage::Approvals,
            format!(
                "stored {} drugs, skipped {}",
                summary.normalized, summary.skipped
            ),
            Some(started.elapsed()),
        );
        Ok(ApprovalsResult {
            payload: payload.to_string(),
            summary,
        })
    }

    pub fn labels(
        &self,
        scope: ResolveScope,
        sink: &dyn ProgressSink,
    ) -> Result<LabelsResult, LyoError> {
        let started = Instant::now();
        emit(sink, Stage::Labels, "resolving DailyMed labels", None);
        let resolver = LabelResolver::new(&self.dailymed, &self.config.urls);
        let resolution = resolve_into_store(
            self.store,
            &resolver,
            scope,
            self.config.batch.progress_every,
        )?;
        emit(
            sink,
            Stage::Labels,
            format!(
                "resolved {} drugs ({} lyophilized, {} failed)",
                resolution.resolved, resolution.lyophilized, resolution.failed
            ),
            Some(started.elapsed()),
        );

        let copy = copy_lyophilized(self.store, self.config.batch.lyophilized_copy)?;
        emit(
            sink,
            Stage::Labels,
            format!("copied {} lyophilized drugs", copy.copied),
            Some(started.elapsed()),
        );
        Ok(LabelsResult { resolution, copy })
    }

    pub fn ingredients(&self, sink: &dyn ProgressSink) -> Result<ExtractionSummary, LyoError> {
        let started = Instant::now();
        emit(sink, Stage::Ingredients, "extracting label ingredients", None);
        let extractor = IngredientExtractor::new(&self.dailymed, &self.config.urls);
        let summary = extract_into_store(
            self.store,
            &extractor,
            ExtractionScope::AllLyophilized,
            self.config.batch.progress_every,
        )?;
        emit(
            sink,
            Stage::Ingredients,
            format!(
                "updated {} drugs from {} labels ({} failed)",
                summary.drugs, summary.labels, summary.failed_labels
            ),
            Some(started.elapsed()),
        );
        Ok(summary)
    }

    pub fn reconcile(&self, sink: &dyn ProgressSink) -> Result<ReconcileResult, LyoError> {
        let started = Instant::now();
        emit(sink, Stage::Reconcile, "scanning lyophilized search results", None);
        let scanner =
            ReconcileScanner::new(&self.dailymed, &self.config.urls).with_retry(self.page_retry);
        let scraped = scanner.scan();

        let corrections = find_corrections(self.store, &scraped)?;
        emit(
            sink,
            Stage::Reconcile,
            format!(
                "{} label ids scraped, {} drugs to correct",
                scraped.len(),
                corrections.len()
            ),
            Some(started.elapsed()),
        );
        let applied = apply_corrections(self.store, &corrections)?;

        let extractor = IngredientExtractor::new(&self.dailymed, &self.config.urls);
        let extraction = extract_into_store(
            self.store,
            &extractor,
            ExtractionScope::Labels(&corrections),
            self.config.batch.progress_every,
        )?;
        emit(
            sink,
            Stage::Reconcile,
            format!("corrected {} drugs", applied.corrected),
            Some(started.elapsed()),
        );

        Ok(ReconcileResult {
            scraped: scraped.len(),
            corrections: corrections
                .iter()
                .map(|(number, setids)| {
                    (
                        number.to_string(),
                        setids.iter().map(ToString::to_string).collect(),
                    )
                })
                .collect(),
            applied,
            extraction,
        })
    }
}

fn emit(sink: &dyn ProgressSink, stage: Stage, message: impl Into<String>, elapsed: Option<Duration>) {
    sink.event(ProgressEvent {
        stage,
        message: message.into(),
        elapsed,
    });
}
