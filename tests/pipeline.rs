//! End-to-end pipeline tests over a temporary SQLite registry and the
//! in-memory object store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use docflow::chunk::Chunk;
use docflow::config::{DbConfig, PipelineSettings};
use docflow::configuration::PipelineConfig;
use docflow::documents::RegisterOutcome;
use docflow::error::{IngestError, Result};
use docflow::extract::{ExtractError, TextExtractor};
use docflow::models::{NewDocument, ProcessingState, StageFields};
use docflow::pipeline::{Pipeline, StageKind};
use docflow::qna::{QnaGenerator, QnaPair};
use docflow::stages::{PreprocessedDocument, QnaDocument};
use docflow::storage::{MemoryObjectStore, ObjectStore};
use tempfile::TempDir;

const CONFIG_NAME: &str = "ai_pipeline";

/// Returns a fixed text for every document except those whose bytes start
/// with `BROKEN` until `heal` is called.
struct FakeExtractor {
    text: String,
    healed: std::sync::atomic::AtomicBool,
    calls: AtomicUsize,
}

impl FakeExtractor {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            healed: std::sync::atomic::AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }
}

impl TextExtractor for FakeExtractor {
    fn extract(&self, bytes: &[u8], _file_type: &str) -> std::result::Result<String, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if bytes.starts_with(b"BROKEN") && !self.healed.load(Ordering::SeqCst) {
            return Err(ExtractError::Pdf("corrupt xref table".into()));
        }
        Ok(self.text.clone())
    }
}

/// One pair per chunk, answering with the chunk's first sentence.
struct EchoGenerator;

#[async_trait]
impl QnaGenerator for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, chunks: &[Chunk]) -> Result<Vec<QnaPair>> {
        Ok(chunks
            .iter()
            .map(|c| QnaPair {
                question: format!("What does excerpt {} say?", c.index),
                answer: c.text.split('.').next().unwrap_or_default().to_string(),
                chunk_index: Some(c.index),
            })
            .collect())
    }
}

struct Harness {
    _tmp: TempDir,
    store: Arc<MemoryObjectStore>,
    pipeline: Pipeline,
}

async fn harness(store: MemoryObjectStore) -> Harness {
    let tmp = TempDir::new().unwrap();
    let pool = docflow::db::connect(&DbConfig {
        path: tmp.path().join("registry.sqlite"),
        max_connections: 4,
    })
    .await
    .unwrap();
    docflow::migrate::run_migrations(&pool).await.unwrap();

    let store = Arc::new(store);
    let settings = PipelineSettings {
        provision_pause_ms: 0,
        ..Default::default()
    };
    let pipeline = Pipeline::new(pool, store.clone() as Arc<dyn ObjectStore>, settings);
    pipeline
        .configurations()
        .write(CONFIG_NAME, &two_tier_config())
        .await
        .unwrap();

    Harness {
        _tmp: tmp,
        store,
        pipeline,
    }
}

fn two_tier_config() -> PipelineConfig {
    serde_json::from_value(serde_json::json!({
        "name": CONFIG_NAME,
        "containers": {"raw": "qna-raw", "bronze": "qna-preprocessed"},
        "filetypes": ["pdf", "md"]
    }))
    .unwrap()
}

fn full_config() -> PipelineConfig {
    serde_json::from_value(serde_json::json!({
        "name": CONFIG_NAME,
        "containers": {
            "raw": "qna-raw",
            "bronze": "qna-preprocessed",
            "silver": "qna-processed"
        },
        "filetypes": ["pdf", "md"]
    }))
    .unwrap()
}

const SAMPLE_TEXT: &str = "Invoices are due within thirty days. Late invoices accrue interest monthly.";

#[tokio::test]
async fn configuration_round_trips() {
    let h = harness(MemoryObjectStore::new()).await;
    let mut config = full_config();
    config
        .extra
        .insert("owner".into(), serde_json::json!({"team": "docs"}));

    h.pipeline.configurations().write("other", &config).await.unwrap();
    let read = h.pipeline.configurations().read("other").await.unwrap();
    assert_eq!(read, config.validate().unwrap());

    let err = h.pipeline.configurations().read("missing").await.unwrap_err();
    assert!(matches!(err, IngestError::ConfigNotFound { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn provisioning_twice_creates_nothing_the_second_time() {
    let h = harness(MemoryObjectStore::with_containers(["qna-raw"])).await;

    let first = h.pipeline.provision().await.unwrap();
    assert_eq!(first.existing, vec!["qna-raw"]);
    assert_eq!(first.created, vec!["qna-preprocessed"]);

    let second = h.pipeline.provision().await.unwrap();
    assert!(second.created.is_empty());
    assert!(second.failed.is_empty());
    assert_eq!(second.existing.len(), 2);
    assert_eq!(h.store.create_calls(), vec!["qna-preprocessed"]);
}

#[tokio::test]
async fn provisioning_continues_past_a_failed_container() {
    let store = MemoryObjectStore::new();
    store.fail_creation_of("qna-preprocessed");
    let h = harness(store).await;
    h.pipeline
        .configurations()
        .write(CONFIG_NAME, &full_config())
        .await
        .unwrap();

    let report = h.pipeline.provision().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].tier, "bronze");
    assert_eq!(report.failed[0].container, "qna-preprocessed");
    assert_eq!(report.created, vec!["qna-raw", "qna-processed"]);
}

#[tokio::test]
async fn scanning_twice_registers_each_object_once() {
    let store = MemoryObjectStore::with_containers(["qna-raw", "qna-preprocessed"]);
    store.put("qna-raw", "doc1.pdf", vec![0u8; 1024]).unwrap();
    store.put("qna-raw", "notes/doc2.md", "# Notes").unwrap();
    let h = harness(store).await;

    let dry = h.pipeline.scan(true).await.unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.registered, 2);
    assert_eq!(h.pipeline.status().await.unwrap().total(), 0);

    let first = h.pipeline.scan(false).await.unwrap();
    assert_eq!((first.listed, first.registered, first.skipped), (2, 2, 0));

    let second = h.pipeline.scan(false).await.unwrap();
    assert_eq!((second.listed, second.registered, second.skipped), (2, 0, 2));

    let raw = h
        .pipeline
        .registry()
        .list_in_state(ProcessingState::Raw, None)
        .await
        .unwrap();
    assert_eq!(raw.len(), 2);
    let doc1 = raw.iter().find(|d| d.raw_file_name == "doc1.pdf").unwrap();
    assert_eq!(doc1.raw_file_size, 1024);
    assert_eq!(doc1.raw_file_type, "pdf");
    assert_eq!(doc1.raw_container, "qna-raw");
    assert_eq!(doc1.raw_storage_path, "memory://qna-raw/doc1.pdf");
}

#[tokio::test]
async fn identity_ignores_size_and_etag() {
    let h = harness(MemoryObjectStore::new()).await;
    let mut candidate = NewDocument {
        source_system: "object-storage".into(),
        source_path: "doc1.pdf".into(),
        raw_container: "qna-raw".into(),
        raw_file_name: "doc1.pdf".into(),
        raw_file_size: 1024,
        raw_etag: "abc".into(),
        raw_file_type: "pdf".into(),
        raw_storage_path: "memory://qna-raw/doc1.pdf".into(),
    };
    let registry = h.pipeline.registry();
    let RegisterOutcome::Inserted(id) = registry.register(&candidate).await.unwrap() else {
        panic!("first registration must insert");
    };

    candidate.raw_file_size = 2048;
    candidate.raw_etag = "def".into();
    assert_eq!(
        registry.register(&candidate).await.unwrap(),
        RegisterOutcome::AlreadyRegistered
    );

    let stored = registry.get(&id).await.unwrap();
    assert_eq!(stored.raw_file_size, 1024);
    assert_eq!(stored.raw_etag, "abc");
}

#[tokio::test]
async fn provision_scan_and_extract_from_an_empty_store() {
    let h = harness(MemoryObjectStore::new()).await;
    let extractor = Arc::new(FakeExtractor::new(SAMPLE_TEXT));
    let pipeline = h.pipeline.with_extractor(extractor.clone());

    let provisioned = pipeline.provision().await.unwrap();
    assert_eq!(provisioned.created, vec!["qna-preprocessed", "qna-raw"]);
    assert!(provisioned.existing.is_empty());

    h.store.put("qna-raw", "doc1.pdf", vec![7u8; 1024]).unwrap();
    let scan = pipeline.scan(false).await.unwrap();
    assert_eq!(scan.registered, 1);
    let raw = pipeline
        .registry()
        .list_in_state(ProcessingState::Raw, None)
        .await
        .unwrap();
    assert_eq!(raw[0].raw_file_size, 1024);
    assert!(raw[0].preprocessed_path.is_none());

    let report = pipeline.run_stage(StageKind::ExtractText, None).await.unwrap();
    assert_eq!((report.selected, report.advanced, report.failed), (1, 1, 0));

    let docs = pipeline
        .registry()
        .list_in_state(ProcessingState::PreprocessingDone, None)
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    let doc = &docs[0];
    assert_eq!(doc.preprocessed_container.as_deref(), Some("qna-preprocessed"));
    let chunks_path = format!("{}/doc1.pdf.chunks.json", doc.id);
    assert_eq!(doc.preprocessed_path.as_deref(), Some(chunks_path.as_str()));
    assert_eq!(doc.preprocessing_chunk_count, Some(1));
    assert!(doc.preprocessed_at.is_some());
    assert!(doc.failure.is_none());

    let bytes = h_download(&pipeline, "qna-preprocessed", &chunks_path).await;
    let body: PreprocessedDocument = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body.document_id, doc.id);
    assert_eq!(body.chunks[0].text, SAMPLE_TEXT);

    // A second run finds nothing in `raw` and leaves the document alone.
    let rerun = pipeline.run_stage(StageKind::ExtractText, None).await.unwrap();
    assert_eq!((rerun.selected, rerun.advanced), (0, 0));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    let after = pipeline.registry().get(&doc.id).await.unwrap();
    assert_eq!(after.processing_state, ProcessingState::PreprocessingDone);
}

#[tokio::test]
async fn same_file_name_in_two_raw_containers_keeps_separate_outputs() {
    let store = MemoryObjectStore::with_containers(["qna-raw", "qna-raw-two", "qna-preprocessed"]);
    store.put("qna-raw", "doc1.pdf", b"first".to_vec()).unwrap();
    store.put("qna-raw-two", "doc1.pdf", b"second".to_vec()).unwrap();
    let h = harness(store).await;
    let pipeline = h
        .pipeline
        .with_extractor(Arc::new(FakeExtractor::new(SAMPLE_TEXT)));

    pipeline.scan(false).await.unwrap();
    pipeline.run_stage(StageKind::ExtractText, None).await.unwrap();

    let moved: PipelineConfig = serde_json::from_value(serde_json::json!({
        "name": CONFIG_NAME,
        "containers": {"raw": "qna-raw-two", "bronze": "qna-preprocessed"},
        "filetypes": ["pdf"]
    }))
    .unwrap();
    pipeline
        .configurations()
        .write(CONFIG_NAME, &moved)
        .await
        .unwrap();
    assert_eq!(pipeline.scan(false).await.unwrap().registered, 1);
    let report = pipeline.run_stage(StageKind::ExtractText, None).await.unwrap();
    assert_eq!((report.selected, report.advanced), (1, 1));

    let docs = pipeline
        .registry()
        .list_in_state(ProcessingState::PreprocessingDone, None)
        .await
        .unwrap();
    assert_eq!(docs.len(), 2);
    assert_ne!(docs[0].raw_container, docs[1].raw_container);
    assert_ne!(docs[0].preprocessed_path, docs[1].preprocessed_path);

    for doc in &docs {
        let path = doc.preprocessed_path.as_deref().unwrap();
        let bytes = h_download(&pipeline, "qna-preprocessed", path).await;
        let body: PreprocessedDocument = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.document_id, doc.id);
    }
}

async fn h_download(pipeline: &Pipeline, container: &str, path: &str) -> Vec<u8> {
    pipeline.store().download(container, path).await.unwrap()
}

#[tokio::test]
async fn failed_documents_are_retried_on_the_next_run() {
    let store = MemoryObjectStore::with_containers(["qna-raw", "qna-preprocessed"]);
    store.put("qna-raw", "good.pdf", "fine").unwrap();
    store.put("qna-raw", "bad.pdf", "BROKEN bytes").unwrap();
    store.put("qna-raw", "image.png", "png").unwrap();
    let h = harness(store).await;
    let extractor = Arc::new(FakeExtractor::new(SAMPLE_TEXT));
    let pipeline = h.pipeline.with_extractor(extractor.clone());

    pipeline.scan(false).await.unwrap();
    let first = pipeline.run_stage(StageKind::ExtractText, None).await.unwrap();
    assert_eq!((first.selected, first.advanced, first.failed), (3, 1, 2));

    let status = pipeline.status().await.unwrap();
    assert_eq!(status.failed(), 2);
    let raw = status
        .counts
        .iter()
        .find(|c| c.state == ProcessingState::Raw)
        .unwrap();
    assert_eq!((raw.total, raw.failed), (2, 2));
    assert!(status
        .failures
        .iter()
        .any(|f| f.raw_file_name == "image.png" && f.message.contains("unsupported file type 'png'")));
    assert!(status
        .failures
        .iter()
        .all(|f| f.stage == "extract_text" && f.state == "raw"));

    extractor.heal();
    let second = pipeline.run_stage(StageKind::ExtractText, None).await.unwrap();
    assert_eq!((second.selected, second.advanced, second.failed), (2, 1, 1));

    let healed = pipeline
        .registry()
        .list_in_state(ProcessingState::PreprocessingDone, None)
        .await
        .unwrap();
    assert_eq!(healed.len(), 2);
    assert!(healed.iter().all(|d| d.failure.is_none()));
}

#[tokio::test]
async fn states_only_move_forward_one_step() {
    let h = harness(MemoryObjectStore::new()).await;
    let registry = h.pipeline.registry();
    let candidate = NewDocument {
        source_system: "object-storage".into(),
        source_path: "doc1.pdf".into(),
        raw_container: "qna-raw".into(),
        raw_file_name: "doc1.pdf".into(),
        raw_file_size: 10,
        raw_etag: "abc".into(),
        raw_file_type: "pdf".into(),
        raw_storage_path: "memory://qna-raw/doc1.pdf".into(),
    };
    let RegisterOutcome::Inserted(id) = registry.register(&candidate).await.unwrap() else {
        panic!("first registration must insert");
    };

    let err = registry
        .advance_state(&id, ProcessingState::Evaluated, StageFields::Evaluated, None)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidTransition { .. }));

    let preprocessed = StageFields::Preprocessed {
        container: "qna-preprocessed".into(),
        path: "doc1.pdf.chunks.json".into(),
        chunk_count: 1,
    };
    registry
        .advance_state(&id, ProcessingState::PreprocessingDone, preprocessed.clone(), None)
        .await
        .unwrap();

    // Replaying the same advance is rejected rather than rewinding anything.
    let err = registry
        .advance_state(&id, ProcessingState::PreprocessingDone, preprocessed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidTransition { .. }));
    assert_eq!(
        registry.get(&id).await.unwrap().processing_state,
        ProcessingState::PreprocessingDone
    );
}

#[tokio::test]
async fn full_run_reaches_evaluated() {
    let store = MemoryObjectStore::with_containers(["qna-raw", "qna-preprocessed", "qna-processed"]);
    store.put("qna-raw", "doc1.pdf", vec![1u8; 1024]).unwrap();
    let h = harness(store).await;
    h.pipeline
        .configurations()
        .write(CONFIG_NAME, &full_config())
        .await
        .unwrap();
    let pipeline = h
        .pipeline
        .with_extractor(Arc::new(FakeExtractor::new(SAMPLE_TEXT)))
        .with_generator(Arc::new(EchoGenerator));

    let report = pipeline.run_all(None).await.unwrap();
    assert_eq!(report.scan.registered, 1);
    assert_eq!(report.stages.len(), 3);
    assert!(report.stages.iter().all(|s| s.advanced == 1 && s.failed == 0));

    let docs = pipeline
        .registry()
        .list_in_state(ProcessingState::Evaluated, None)
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    let doc = &docs[0];
    assert_eq!(doc.qna_container.as_deref(), Some("qna-processed"));
    let qna_path = format!("{}/doc1.pdf.qna.json", doc.id);
    assert_eq!(doc.qna_path.as_deref(), Some(qna_path.as_str()));
    assert!(doc.qna_extracted_at.is_some());
    assert!(doc.evaluated_at.is_some());

    let evaluation = doc.evaluation_messages.as_ref().unwrap();
    assert_eq!(evaluation["method"], "term_overlap");
    assert!(evaluation["mean_score"].as_f64().unwrap() > 0.9);

    let bytes = h_download(&pipeline, "qna-processed", &qna_path).await;
    let qna: QnaDocument = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(qna.model, "echo");
    assert_eq!(qna.pairs.len(), 1);
}

#[tokio::test]
async fn run_all_stops_after_extraction_without_a_generator() {
    let store = MemoryObjectStore::with_containers(["qna-raw", "qna-preprocessed"]);
    store.put("qna-raw", "doc1.md", "# Title\n\nBody text.").unwrap();
    let h = harness(store).await;

    let report = h.pipeline.run_all(None).await.unwrap();
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].stage, "extract_text");
    assert_eq!(report.stages[0].advanced, 1);

    let err = h
        .pipeline
        .run_stage(StageKind::AiProcess, None)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(
        h.pipeline
            .registry()
            .list_in_state(ProcessingState::PreprocessingDone, None)
            .await
            .unwrap()
            .len(),
        1
    );
}
