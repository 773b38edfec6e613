use super::*;
use crate::clusterer::ClusterParams;
use crate::db::{NewCluster, QuestionStore, SqliteStore};
use crate::embedder::{EmbedError, Embedder};
use crate::model::{Question, QuestionCluster, Scope, SessionStatus};
use crate::summarizer::{
    ChatMessage, ClusterSummarizer, CompletionOptions, Generator, SummarizerError,
    SINGLE_QUESTION_SUMMARY,
};
use crate::worker::{AnalysisJob, JobHandler};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Looks vectors up by question text; unknown text fails
struct MapEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
}

impl MapEmbedder {
    fn new(entries: &[(&str, Vec<f32>)]) -> Arc<Self> {
        Arc::new(Self {
            vectors: entries
                .iter()
                .map(|(t, v)| (t.to_string(), v.clone()))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Embedder for MapEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.vectors
            .get(text)
            .cloned()
            .ok_or_else(|| EmbedError::UnrecognizedShape(format!("no vector for {text}")))
    }
}

/// Replies with a fixed string, or fails every call, and records prompts
struct ScriptedGenerator {
    reply: Option<String>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: CompletionOptions,
    ) -> Result<String, SummarizerError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        match &self.reply {
            Some(r) => Ok(r.clone()),
            None => Err(SummarizerError::ServerError {
                status: 503,
                body: "model offline".into(),
            }),
        }
    }
}

/// Delegates to SQLite but refuses to write clusters
struct ReadOnlyClusters(Arc<SqliteStore>);

impl QuestionStore for ReadOnlyClusters {
    fn questions_in_scope(&self, scope: &Scope) -> anyhow::Result<Vec<Question>> {
        self.0.questions_in_scope(scope)
    }

    fn set_embedding(&self, question_id: &str, embedding: &[f32]) -> anyhow::Result<()> {
        self.0.set_embedding(question_id, embedding)
    }

    fn replace_clusters(
        &self,
        _scope: &Scope,
        _clusters: &[NewCluster],
    ) -> anyhow::Result<Vec<QuestionCluster>> {
        anyhow::bail!("disk full")
    }

    fn set_session_status(&self, session_id: &str, status: SessionStatus) -> anyhow::Result<()> {
        self.0.set_session_status(session_id, status)
    }
}

const SESSION: &str = "sess-1";

fn store_with(texts: &[&str]) -> (Arc<SqliteStore>, Vec<Question>) {
    store_with_iterations(&texts.iter().map(|t| (*t, 1)).collect::<Vec<_>>())
}

fn store_with_iterations(entries: &[(&str, u32)]) -> (Arc<SqliteStore>, Vec<Question>) {
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    store.create_session(SESSION, "Office hours").unwrap();
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
    let questions = entries
        .iter()
        .enumerate()
        .map(|(i, (text, iteration))| {
            store
                .insert_question(SESSION, text, *iteration, start + Duration::seconds(i as i64))
                .unwrap()
        })
        .collect();
    (store, questions)
}

fn analyzer(
    store: Arc<dyn QuestionStore>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    params: ClusterParams,
) -> Analyzer {
    Analyzer::new(
        store,
        embedder,
        ClusterSummarizer::new(generator),
        AnalysisSettings {
            params,
            ..AnalysisSettings::default()
        },
    )
}

const EXAM_WHEN: &str = "When is the exam?";
const EXAM_DATE: &str = "What date is the exam?";
const GRADING: &str = "How is the course graded?";
const GRADING_SCHEME: &str = "What is the grading scheme?";
const ROOM: &str = "Where is the lecture room?";

fn five_topic_embedder() -> Arc<MapEmbedder> {
    MapEmbedder::new(&[
        (EXAM_WHEN, vec![1.0, 0.0, 0.0]),
        (EXAM_DATE, vec![0.98, 0.2, 0.0]),
        (GRADING, vec![0.0, 1.0, 0.0]),
        (GRADING_SCHEME, vec![0.0, 0.97, 0.24]),
        (ROOM, vec![0.0, 0.0, 1.0]),
    ])
}

#[tokio::test]
async fn test_two_topics_and_an_outlier() {
    let (store, qs) = store_with(&[EXAM_WHEN, EXAM_DATE, GRADING, GRADING_SCHEME, ROOM]);
    let embedder = five_topic_embedder();
    let gen = ScriptedGenerator::replying(r#"{"representative": "Rep?", "summary": "Label"}"#);

    let report = analyzer(store.clone(), embedder.clone(), gen.clone(), ClusterParams::default())
        .run(&Scope::session(SESSION))
        .await
        .unwrap();

    assert_eq!(report.outcome, AnalysisOutcome::Clustered);
    assert_eq!(report.questions, 5);
    assert_eq!(report.embedded, 5);
    assert_eq!(report.clusters.len(), 2);
    assert!(report.clusters.iter().all(|c| c.question_count == 2));
    assert!(report.clusters.iter().all(|c| c.iteration == 1));
    assert_eq!(report.clusters[0].label.as_deref(), Some("Label"));
    assert_eq!(report.clusters[0].representative_question, "Rep?");
    assert_eq!(report.clusters[0].centroid.as_ref().map(Vec::len), Some(3));

    assert_eq!(
        store.question_ids_in_cluster(&report.clusters[0].id).unwrap(),
        vec![qs[0].id.clone(), qs[1].id.clone()]
    );
    assert_eq!(
        store.question_ids_in_cluster(&report.clusters[1].id).unwrap(),
        vec![qs[2].id.clone(), qs[3].id.clone()]
    );
    assert_eq!(store.get_question(&qs[4].id).unwrap().unwrap().cluster_id, None);
    assert_eq!(
        store.session_status(SESSION).unwrap(),
        Some(SessionStatus::Analyzed)
    );

    // each summarizer call saw exactly its own members, in order
    let prompts = gen.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0][1].content.contains(&format!("1. {EXAM_WHEN}\n2. {EXAM_DATE}")));
    assert!(prompts[1][1].content.contains(&format!("1. {GRADING}\n2. {GRADING_SCHEME}")));
}

#[tokio::test]
async fn test_embeddings_are_written_back() {
    let (store, qs) = store_with(&[EXAM_WHEN, EXAM_DATE]);
    analyzer(
        store.clone(),
        five_topic_embedder(),
        ScriptedGenerator::replying("{}"),
        ClusterParams::default(),
    )
    .run(&Scope::session(SESSION))
    .await
    .unwrap();

    let stored = store.get_question(&qs[1].id).unwrap().unwrap();
    assert_eq!(stored.embedding, Some(vec![0.98, 0.2, 0.0]));
}

#[tokio::test]
async fn test_stored_embeddings_skip_the_embedder() {
    let (store, qs) = store_with(&[EXAM_WHEN, EXAM_DATE]);
    store.set_embedding(&qs[0].id, &[1.0, 0.0, 0.0]).unwrap();
    store.set_embedding(&qs[1].id, &[0.98, 0.2, 0.0]).unwrap();
    let embedder = MapEmbedder::new(&[]);

    let report = analyzer(
        store,
        embedder.clone(),
        ScriptedGenerator::replying("{}"),
        ClusterParams::default(),
    )
    .run(&Scope::session(SESSION))
    .await
    .unwrap();

    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.embedded, 0);
    assert_eq!(report.clusters.len(), 1);
}

#[tokio::test]
async fn test_empty_session_reports_no_questions() {
    let (store, _) = store_with(&[]);
    let gen = ScriptedGenerator::replying("{}");

    let report = analyzer(store.clone(), MapEmbedder::new(&[]), gen.clone(), ClusterParams::default())
        .run(&Scope::session(SESSION))
        .await
        .unwrap();

    assert_eq!(report.outcome, AnalysisOutcome::NoQuestions);
    assert!(report.clusters.is_empty());
    assert!(gen.prompts.lock().unwrap().is_empty());
    assert_eq!(
        store.session_status(SESSION).unwrap(),
        Some(SessionStatus::Analyzed)
    );
}

#[tokio::test]
async fn test_no_embeddings_falls_back_to_one_group() {
    let (store, qs) = store_with(&["a?", "b?", "c?"]);
    let gen = ScriptedGenerator::replying(r#"{"representative": "All of it?", "summary": "Mixed"}"#);

    let report = analyzer(store.clone(), MapEmbedder::new(&[]), gen, ClusterParams::default())
        .run(&Scope::session(SESSION))
        .await
        .unwrap();

    assert_eq!(report.outcome, AnalysisOutcome::Fallback);
    assert_eq!(report.unembedded, 3);
    assert_eq!(report.clusters.len(), 1);
    let cluster = &report.clusters[0];
    assert_eq!(cluster.question_count, 3);
    assert_eq!(cluster.centroid, None);
    assert_eq!(cluster.representative_question, "All of it?");
    assert_eq!(
        store.question_ids_in_cluster(&cluster.id).unwrap(),
        qs.iter().map(|q| q.id.clone()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_fallback_group_respects_min_size() {
    let (store, _) = store_with(&["lonely?"]);
    let report = analyzer(
        store,
        MapEmbedder::new(&[]),
        ScriptedGenerator::replying("{}"),
        ClusterParams::default(),
    )
    .run(&Scope::session(SESSION))
    .await
    .unwrap();

    assert_eq!(report.outcome, AnalysisOutcome::Fallback);
    assert!(report.clusters.is_empty());
}

#[tokio::test]
async fn test_partial_embedding_failure_excludes_question() {
    let (store, qs) = store_with(&[EXAM_WHEN, "unembeddable?", EXAM_DATE]);
    let report = analyzer(
        store.clone(),
        five_topic_embedder(),
        ScriptedGenerator::replying("{}"),
        ClusterParams::default(),
    )
    .run(&Scope::session(SESSION))
    .await
    .unwrap();

    assert_eq!(report.outcome, AnalysisOutcome::Clustered);
    assert_eq!(report.unembedded, 1);
    assert_eq!(report.clusters.len(), 1);
    assert_eq!(
        store.question_ids_in_cluster(&report.clusters[0].id).unwrap(),
        vec![qs[0].id.clone(), qs[2].id.clone()]
    );
    assert_eq!(store.get_question(&qs[1].id).unwrap().unwrap().cluster_id, None);
}

#[tokio::test]
async fn test_wrong_dimension_is_excluded() {
    let (store, _) = store_with(&[EXAM_WHEN, EXAM_DATE, "short?"]);
    let embedder = MapEmbedder::new(&[
        (EXAM_WHEN, vec![1.0, 0.0, 0.0]),
        (EXAM_DATE, vec![0.98, 0.2, 0.0]),
        ("short?", vec![1.0, 0.0]),
    ]);
    let analyzer = Analyzer::new(
        store,
        embedder,
        ClusterSummarizer::new(ScriptedGenerator::replying("{}")),
        AnalysisSettings {
            expected_dim: Some(3),
            ..AnalysisSettings::default()
        },
    );

    let report = analyzer.run(&Scope::session(SESSION)).await.unwrap();
    assert_eq!(report.unembedded, 1);
    assert_eq!(report.clusters.len(), 1);
    assert_eq!(report.clusters[0].question_count, 2);
}

#[tokio::test]
async fn test_malformed_summary_degrades_label() {
    let (store, _) = store_with(&[EXAM_WHEN, EXAM_DATE, "Exam day?"]);
    let embedder = MapEmbedder::new(&[
        (EXAM_WHEN, vec![1.0, 0.0, 0.0]),
        (EXAM_DATE, vec![0.98, 0.2, 0.0]),
        ("Exam day?", vec![0.99, 0.1, 0.05]),
    ]);
    let report = analyzer(
        store,
        embedder,
        ScriptedGenerator::replying("People want to know about the exam."),
        ClusterParams::default(),
    )
    .run(&Scope::session(SESSION))
    .await
    .unwrap();

    let cluster = &report.clusters[0];
    assert_eq!(cluster.question_count, 3);
    assert_eq!(report.degraded_summaries, 1);
    assert_eq!(cluster.representative_question, EXAM_WHEN);
    assert_eq!(cluster.label.as_deref(), Some("People want to know about the exam."));
}

#[tokio::test]
async fn test_unavailable_model_uses_centroid_representative() {
    let (store, _) = store_with(&["edge a?", "middle?", "edge b?"]);
    let embedder = MapEmbedder::new(&[
        ("edge a?", vec![1.0, 0.0]),
        ("middle?", vec![0.95, 0.31]),
        ("edge b?", vec![0.81, 0.59]),
    ]);
    let report = analyzer(
        store,
        embedder,
        ScriptedGenerator::failing(),
        ClusterParams {
            threshold: 0.7,
            min_size: 2,
        },
    )
    .run(&Scope::session(SESSION))
    .await
    .unwrap();

    assert_eq!(report.clusters.len(), 1);
    let cluster = &report.clusters[0];
    assert_eq!(cluster.representative_question, "middle?");
    assert_eq!(cluster.label.as_deref(), Some("3 similar questions"));
    assert_eq!(report.degraded_summaries, 1);
}

#[tokio::test]
async fn test_singleton_clusters_skip_the_model() {
    let (store, _) = store_with(&[EXAM_WHEN, GRADING]);
    let gen = ScriptedGenerator::replying("{}");
    let report = analyzer(
        store,
        five_topic_embedder(),
        gen.clone(),
        ClusterParams {
            threshold: 0.85,
            min_size: 1,
        },
    )
    .run(&Scope::session(SESSION))
    .await
    .unwrap();

    assert_eq!(report.clusters.len(), 2);
    assert!(report
        .clusters
        .iter()
        .all(|c| c.label.as_deref() == Some(SINGLE_QUESTION_SUMMARY)));
    assert_eq!(report.clusters[1].representative_question, GRADING);
    assert!(gen.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rerun_replaces_previous_clusters() {
    let (store, qs) = store_with(&[EXAM_WHEN, EXAM_DATE, GRADING]);
    let run = || {
        analyzer(
            store.clone(),
            five_topic_embedder(),
            ScriptedGenerator::replying("{}"),
            ClusterParams::default(),
        )
    };

    let first = run().run(&Scope::session(SESSION)).await.unwrap();
    let second = run().run(&Scope::session(SESSION)).await.unwrap();

    assert_eq!(first.clusters.len(), 1);
    assert_eq!(second.clusters.len(), 1);
    assert_ne!(first.clusters[0].id, second.clusters[0].id);

    let remaining = store.clusters_in_scope(&Scope::session(SESSION)).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, second.clusters[0].id);
    assert_eq!(
        store.get_question(&qs[0].id).unwrap().unwrap().cluster_id,
        Some(second.clusters[0].id.clone())
    );
}

#[tokio::test]
async fn test_iteration_scope_only_touches_its_round() {
    let (store, _) = store_with_iterations(&[
        (EXAM_WHEN, 1),
        (EXAM_DATE, 1),
        (GRADING, 2),
        (GRADING_SCHEME, 2),
    ]);
    let make = || {
        analyzer(
            store.clone(),
            five_topic_embedder(),
            ScriptedGenerator::replying("{}"),
            ClusterParams::default(),
        )
    };

    make().run(&Scope::iteration(SESSION, 1)).await.unwrap();
    let report = make().run(&Scope::iteration(SESSION, 2)).await.unwrap();

    assert_eq!(report.clusters.len(), 1);
    assert_eq!(report.clusters[0].iteration, 2);
    assert_eq!(store.clusters_in_scope(&Scope::iteration(SESSION, 1)).unwrap().len(), 1);
    assert_eq!(store.clusters_in_scope(&Scope::session(SESSION)).unwrap().len(), 2);
}

#[tokio::test]
async fn test_iteration_rerun_never_leaves_undersized_clusters() {
    const EXAM_DAY: &str = "Which day is the exam on?";
    let (store, qs) = store_with_iterations(&[(EXAM_WHEN, 1), (EXAM_DATE, 2), (EXAM_DAY, 2)]);
    let make = || {
        analyzer(
            store.clone(),
            MapEmbedder::new(&[
                (EXAM_WHEN, vec![1.0, 0.0, 0.0]),
                (EXAM_DATE, vec![0.99, 0.1, 0.0]),
                (EXAM_DAY, vec![0.98, 0.2, 0.0]),
            ]),
            ScriptedGenerator::replying("{}"),
            ClusterParams::default(),
        )
    };

    let whole = make().run(&Scope::session(SESSION)).await.unwrap();
    assert_eq!(whole.clusters.len(), 1);
    assert_eq!(whole.clusters[0].iteration, 1);

    let round_two = make().run(&Scope::iteration(SESSION, 2)).await.unwrap();
    assert_eq!(round_two.clusters.len(), 1);

    let stored = store.clusters_in_scope(&Scope::session(SESSION)).unwrap();
    assert!(stored.iter().all(|c| c.question_count >= 2));
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].iteration, 2);
    assert_eq!(store.get_question(&qs[0].id).unwrap().unwrap().cluster_id, None);
}

#[tokio::test]
async fn test_iteration_zero_job_analyzes_whole_session() {
    let (store, _) = store_with_iterations(&[(EXAM_WHEN, 1), (EXAM_DATE, 2)]);
    let analyzer = analyzer(
        store.clone(),
        five_topic_embedder(),
        ScriptedGenerator::replying("{}"),
        ClusterParams::default(),
    );

    analyzer
        .handle(&AnalysisJob::new(SESSION, Some(0)))
        .await
        .unwrap();

    let stored = store.clusters_in_scope(&Scope::session(SESSION)).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].question_count, 2);
}

#[tokio::test]
async fn test_session_scope_takes_iteration_from_first_question() {
    let (store, _) = store_with_iterations(&[(EXAM_WHEN, 3), (EXAM_DATE, 3)]);
    let report = analyzer(
        store,
        five_topic_embedder(),
        ScriptedGenerator::replying("{}"),
        ClusterParams::default(),
    )
    .run(&Scope::session(SESSION))
    .await
    .unwrap();

    assert_eq!(report.clusters[0].iteration, 3);
}

#[tokio::test]
async fn test_persistence_failure_reports_stage() {
    let (sqlite, qs) = store_with(&[EXAM_WHEN, EXAM_DATE]);
    let store = Arc::new(ReadOnlyClusters(sqlite.clone()));

    let err = analyzer(
        store,
        five_topic_embedder(),
        ScriptedGenerator::replying("{}"),
        ClusterParams::default(),
    )
    .run(&Scope::session(SESSION))
    .await
    .unwrap_err();

    assert_eq!(err.stage(), JobStage::Persisting);
    assert!(err.to_string().contains("disk full"));
    assert_eq!(sqlite.get_question(&qs[0].id).unwrap().unwrap().cluster_id, None);
    assert_eq!(
        sqlite.session_status(SESSION).unwrap(),
        Some(SessionStatus::Analyzing)
    );
}

#[tokio::test]
async fn test_unknown_session_fails_before_loading() {
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    let err = analyzer(
        store,
        MapEmbedder::new(&[]),
        ScriptedGenerator::replying("{}"),
        ClusterParams::default(),
    )
    .run(&Scope::session("missing"))
    .await
    .unwrap_err();

    assert_eq!(err.stage(), JobStage::Received);
}
