use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::error::AnalysisError;
use super::stage::JobStage;
use crate::clusterer::{agglomerate, most_representative, ClusterParams, EmbeddedQuestion};
use crate::db::{NewCluster, QuestionStore};
use crate::embedder::{Batcher, Embedder};
use crate::model::{Question, QuestionCluster, Scope, SessionStatus};
use crate::summarizer::{ClusterSummarizer, SummaryOutcome};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisSettings {
    pub params: ClusterParams,
    /// When set, vectors of any other length are treated as missing
    pub expected_dim: Option<usize>,
    /// Concurrent embedding calls per wave
    pub embedding_wave: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            params: ClusterParams::default(),
            expected_dim: None,
            embedding_wave: crate::embedder::DEFAULT_WAVE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    /// The scope had no questions
    NoQuestions,
    /// Similarity clustering ran; zero clusters is still this outcome
    Clustered,
    /// No embeddings were available, so every question went into one group
    Fallback,
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub scope: Scope,
    pub outcome: AnalysisOutcome,
    pub questions: usize,
    /// Embeddings generated during this run
    pub embedded: usize,
    /// Questions left out because no embedding could be obtained
    pub unembedded: usize,
    pub degraded_summaries: usize,
    pub clusters: Vec<QuestionCluster>,
}

/// A group chosen for persistence, before it has a label
struct PlannedGroup {
    question_ids: Vec<String>,
    texts: Vec<String>,
    centroid: Option<Vec<f32>>,
    /// Question closest to the centroid, or the earliest one without embeddings
    nearest: String,
}

/// Runs one analysis job end to end against the shared store
pub struct Analyzer {
    store: Arc<dyn QuestionStore>,
    embedder: Arc<dyn Embedder>,
    summarizer: ClusterSummarizer,
    settings: AnalysisSettings,
}

impl Analyzer {
    pub fn new(
        store: Arc<dyn QuestionStore>,
        embedder: Arc<dyn Embedder>,
        summarizer: ClusterSummarizer,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            summarizer,
            settings,
        }
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    pub async fn run(&self, scope: &Scope) -> Result<AnalysisReport, AnalysisError> {
        let span = info_span!("analysis", session_id = %scope.session_id, iteration = ?scope.iteration);
        let result = self.run_stages(scope).instrument(span.clone()).await;

        let _entered = span.enter();
        match &result {
            Ok(report) => info!(
                stage = %JobStage::Done,
                clusters = report.clusters.len(),
                questions = report.questions,
                outcome = ?report.outcome,
                "analysis complete"
            ),
            Err(e) => error!(stage = %JobStage::Failed, failed_in = %e.stage(), error = %e, "analysis failed"),
        }
        result
    }

    async fn run_stages(&self, scope: &Scope) -> Result<AnalysisReport, AnalysisError> {
        info!(stage = %JobStage::Received, "analysis received");
        self.set_status(scope, SessionStatus::Analyzing, JobStage::Received)
            .await?;

        let load_scope = scope.clone();
        let questions = self
            .blocking(move |store| store.questions_in_scope(&load_scope))
            .await
            .map_err(|cause| AnalysisError::Load {
                scope: scope.clone(),
                cause,
            })?;

        if questions.is_empty() {
            info!("no questions to analyze");
            self.persist(scope, Vec::new()).await?;
            self.set_status(scope, SessionStatus::Analyzed, JobStage::Persisting)
                .await?;
            return Ok(AnalysisReport {
                scope: scope.clone(),
                outcome: AnalysisOutcome::NoQuestions,
                questions: 0,
                embedded: 0,
                unembedded: 0,
                degraded_summaries: 0,
                clusters: Vec::new(),
            });
        }

        info!(stage = %JobStage::Embedding, questions = questions.len(), "collecting embeddings");
        let (embedded, fresh) = self.collect_embeddings(&questions).await;
        let unembedded = questions.len() - embedded.len();

        let (outcome, groups) = if embedded.is_empty() {
            warn!(
                stage = %JobStage::Clustering,
                questions = questions.len(),
                "no embeddings available, grouping all questions together"
            );
            (AnalysisOutcome::Fallback, self.fallback_group(&questions))
        } else {
            info!(stage = %JobStage::Clustering, embedded = embedded.len(), "clustering questions");
            let groups = self.cluster(scope, &embedded)?;
            (AnalysisOutcome::Clustered, groups)
        };
        info!(groups = groups.len(), "grouping finished");

        info!(stage = %JobStage::Summarizing, "summarizing clusters");
        let iteration = scope
            .iteration
            .or_else(|| questions.first().map(|q| q.iteration))
            .unwrap_or(1);
        let mut degraded_summaries = 0;
        let mut planned = Vec::with_capacity(groups.len());

        for (idx, group) in groups.into_iter().enumerate() {
            let summary = self.summarizer.summarize(&group.texts).await;
            if summary.is_degraded() {
                degraded_summaries += 1;
            }
            debug!(cluster = idx + 1, size = group.texts.len(), outcome = ?summary.outcome, "cluster summarized");

            let representative_question = match summary.outcome {
                SummaryOutcome::Unavailable(_) => group.nearest,
                _ => summary.representative,
            };
            planned.push(NewCluster {
                iteration,
                label: Some(summary.summary),
                representative_question,
                centroid: group.centroid,
                question_ids: group.question_ids,
            });
        }

        info!(stage = %JobStage::Persisting, clusters = planned.len(), "persisting clusters");
        let clusters = self.persist(scope, planned).await?;
        self.set_status(scope, SessionStatus::Analyzed, JobStage::Persisting)
            .await?;

        Ok(AnalysisReport {
            scope: scope.clone(),
            outcome,
            questions: questions.len(),
            embedded: fresh,
            unembedded,
            degraded_summaries,
            clusters,
        })
    }

    fn fits(&self, v: &[f32]) -> bool {
        !v.is_empty() && self.settings.expected_dim.is_none_or(|d| d == v.len())
    }

    /// Questions with a usable vector, in submission order, plus how many
    /// vectors were generated here. Failed questions are left out.
    async fn collect_embeddings(&self, questions: &[Question]) -> (Vec<EmbeddedQuestion>, usize) {
        let mut slots: Vec<Option<Vec<f32>>> = questions
            .iter()
            .map(|q| q.usable_embedding().filter(|v| self.fits(v)).map(<[f32]>::to_vec))
            .collect();

        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.is_none().then_some(i))
            .collect();
        let texts: Vec<String> = missing.iter().map(|&i| questions[i].text.clone()).collect();

        let batcher = Batcher::new(self.settings.embedding_wave);
        let results = batcher.embed_all(self.embedder.as_ref(), &texts).await;

        let mut fresh = 0;
        for (&i, result) in missing.iter().zip(results) {
            let question = &questions[i];
            match result {
                Ok(v) if self.fits(&v) => {
                    let (id, vector) = (question.id.clone(), v.clone());
                    let stored = self
                        .blocking(move |store| store.set_embedding(&id, &vector))
                        .await;
                    if let Err(e) = stored {
                        warn!(question_id = %question.id, error = %format!("{e:#}"), "failed to store embedding");
                    }
                    slots[i] = Some(v);
                    fresh += 1;
                }
                Ok(v) => warn!(
                    question_id = %question.id,
                    dim = v.len(),
                    expected = ?self.settings.expected_dim,
                    "embedding has wrong dimension, skipping question"
                ),
                Err(e) => warn!(question_id = %question.id, error = %e, "embedding unavailable, skipping question"),
            }
        }

        let embedded = questions
            .iter()
            .zip(slots)
            .filter_map(|(q, slot)| {
                slot.map(|embedding| EmbeddedQuestion {
                    id: q.id.clone(),
                    text: q.text.clone(),
                    embedding,
                })
            })
            .collect();

        (embedded, fresh)
    }

    fn cluster(
        &self,
        scope: &Scope,
        embedded: &[EmbeddedQuestion],
    ) -> Result<Vec<PlannedGroup>, AnalysisError> {
        let similarity_failure = |source| AnalysisError::Similarity {
            scope: scope.clone(),
            source,
        };

        let result = agglomerate(embedded, &self.settings.params).map_err(similarity_failure)?;
        debug!(merges = result.merges, discarded = result.discarded, "clustering converged");

        result
            .clusters
            .into_iter()
            .map(|cluster| -> Result<PlannedGroup, AnalysisError> {
                let members: Vec<&EmbeddedQuestion> =
                    cluster.members.iter().map(|&m| &embedded[m]).collect();
                let vectors: Vec<&[f32]> = members.iter().map(|q| q.embedding.as_slice()).collect();
                let nearest = most_representative(&vectors).map_err(similarity_failure)?;

                Ok(PlannedGroup {
                    question_ids: members.iter().map(|q| q.id.clone()).collect(),
                    texts: members.iter().map(|q| q.text.clone()).collect(),
                    nearest: members[nearest].text.clone(),
                    centroid: Some(cluster.centroid),
                })
            })
            .collect()
    }

    /// One group holding every question, still subject to the minimum size
    fn fallback_group(&self, questions: &[Question]) -> Vec<PlannedGroup> {
        if questions.is_empty() || questions.len() < self.settings.params.min_size {
            return Vec::new();
        }
        vec![PlannedGroup {
            question_ids: questions.iter().map(|q| q.id.clone()).collect(),
            texts: questions.iter().map(|q| q.text.clone()).collect(),
            nearest: questions[0].text.clone(),
            centroid: None,
        }]
    }

    /// Run a store call on the blocking pool
    async fn blocking<T, F>(&self, call: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn QuestionStore) -> anyhow::Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .context("Store call did not complete")?
    }

    async fn persist(
        &self,
        scope: &Scope,
        clusters: Vec<NewCluster>,
    ) -> Result<Vec<QuestionCluster>, AnalysisError> {
        let target = scope.clone();
        self.blocking(move |store| store.replace_clusters(&target, &clusters))
            .await
            .map_err(|cause| AnalysisError::Persistence {
                scope: scope.clone(),
                cause,
            })
    }

    async fn set_status(
        &self,
        scope: &Scope,
        status: SessionStatus,
        stage: JobStage,
    ) -> Result<(), AnalysisError> {
        let session_id = scope.session_id.clone();
        self.blocking(move |store| store.set_session_status(&session_id, status))
            .await
            .map_err(|cause| AnalysisError::Status {
                session_id: scope.session_id.clone(),
                stage,
                cause,
            })
    }
}
