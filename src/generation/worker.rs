//! Background chapter generation for one job
//!
//! A [`ChapterWorker`] drives a [`GenerationJob`](crate::storage::GenerationJob)
//! from `queued` to a terminal status. Every chapter is written as a chunk
//! before it is offered to the stream, so a reader that goes away loses
//! nothing: the content stays available through
//! [`GenerationJobTracker::get_job_content`].

use super::collaborators::{
    ChapterContext, LanguageModel, PrivateRetrieval, PromptAssembler, SearchClient, SearchResult,
};
use super::deadline::{is_cancellation, is_interruption, run_step, GenerationStep, StepDeadlines};
use super::outline::{split_chapters, ChapterRequest};
use super::references::{format_sources, process_references};
use crate::config::GenerationConfig;
use crate::error::{ChapterflowError, Result};
use crate::storage::{
    ChapterReferences, Database, GenerationChunk, GenerationJobTracker, JobStatus, RecordStore,
};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffered events between the worker and its reader
pub const STREAM_BUFFER: usize = 32;

/// Private content at or above this many characters makes web search unnecessary
pub const MIN_PRIVATE_CONTENT_CHARS: usize = 3500;

/// External services used by the worker
#[derive(Clone)]
pub struct Collaborators {
    pub model: Arc<dyn LanguageModel>,
    pub search: Option<Arc<dyn SearchClient>>,
    pub retrieval: Option<Arc<dyn PrivateRetrieval>>,
    pub prompts: Arc<dyn PromptAssembler>,
}

impl Collaborators {
    /// Model only, with the default prompts and no search or retrieval
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            search: None,
            retrieval: None,
            prompts: Arc::new(super::collaborators::DefaultPromptAssembler),
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchClient>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn PrivateRetrieval>) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptAssembler>) -> Self {
        self.prompts = prompts;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("search", &self.search.is_some())
            .field("retrieval", &self.retrieval.is_some())
            .finish_non_exhaustive()
    }
}

/// What to generate for a job
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub job_id: String,
    pub session_key: String,
    /// Record that receives the chapters and their references
    pub record_id: Option<i64>,
    pub topic: String,
    pub outline: String,
    pub chapters: Vec<ChapterRequest>,
}

impl GenerationRequest {
    /// Request covering every chapter of `outline`
    pub fn from_outline(
        job_id: impl Into<String>,
        session_key: impl Into<String>,
        record_id: Option<i64>,
        topic: impl Into<String>,
        outline: impl Into<String>,
    ) -> Self {
        let outline = outline.into();
        Self {
            job_id: job_id.into(),
            session_key: session_key.into(),
            record_id,
            topic: topic.into(),
            chapters: split_chapters(&outline),
            outline,
        }
    }

    /// Continue a partially written article from chapter `start`
    pub fn starting_at(mut self, start: usize) -> Self {
        self.chapters.retain(|chapter| chapter.index >= start);
        self
    }

    /// Regenerate a single chapter
    pub fn only_chapter(mut self, index: usize) -> Self {
        self.chapters.retain(|chapter| chapter.index == index);
        self
    }
}

/// Progress reported to the stream reader
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The job moved to `running`
    Started { job_id: String, chapters: usize },
    /// A chapter was persisted
    Chunk(GenerationChunk),
    /// The job reached a terminal status
    Finished {
        status: JobStatus,
        error: Option<String>,
    },
}

/// Text and citations produced for one chapter
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterOutput {
    pub content: String,
    pub references: ChapterReferences,
}

/// Runs generation jobs in the background
#[derive(Debug, Clone)]
pub struct ChapterWorker {
    jobs: GenerationJobTracker,
    records: RecordStore,
    collaborators: Collaborators,
    deadlines: StepDeadlines,
    search_top_k: usize,
    retrieval_top_k: usize,
}

impl ChapterWorker {
    pub fn new(db: Database, collaborators: Collaborators, config: &GenerationConfig) -> Self {
        Self {
            jobs: GenerationJobTracker::new(db.clone())
                .with_chunk_insert_retries(config.chunk_insert_retries),
            records: RecordStore::new(db),
            collaborators,
            deadlines: StepDeadlines::from_config(config),
            search_top_k: config.search_top_k,
            retrieval_top_k: config.retrieval_top_k,
        }
    }

    pub fn with_deadlines(mut self, deadlines: StepDeadlines) -> Self {
        self.deadlines = deadlines;
        self
    }

    /// Start the job on the runtime
    ///
    /// The receiver may be dropped at any time; the job keeps running and
    /// its chunks remain in storage. Cancel `cancel` (or the job's status
    /// flag) to stop between steps.
    pub fn spawn(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> (JoinHandle<Result<JobStatus>>, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.run(request, cancel, tx).await });
        (handle, rx)
    }

    /// Drive the job to completion on the current task
    ///
    /// Returns the terminal status. Step failures end the job as `failed`
    /// and are reported through the status, not as an `Err`.
    ///
    /// # Errors
    ///
    /// Returns an error if the job does not exist or storage fails.
    pub async fn run(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<JobStatus> {
        let job_id = request.job_id.clone();
        let jobs = self.jobs.clone();
        let (id, record_id) = (job_id.clone(), request.record_id);
        let started =
            blocking(move || jobs.update_status(&id, JobStatus::Running, record_id)).await?;
        if !started {
            return Err(ChapterflowError::not_found("job", &job_id).into());
        }
        info!(job_id = %job_id, chapters = request.chapters.len(), "Generation started");
        send(
            &tx,
            StreamEvent::Started {
                job_id: job_id.clone(),
                chapters: request.chapters.len(),
            },
        )
        .await;

        let (status, failure) = match self.generate_all(&request, &cancel, &tx).await {
            Ok(()) => (JobStatus::Succeeded, None),
            Err(e) if is_cancellation(&e) => (JobStatus::Canceled, None),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Generation failed");
                (JobStatus::Failed, Some(e.to_string()))
            }
        };

        let status = self.finish(&job_id, status).await?;
        send(
            &tx,
            StreamEvent::Finished {
                status,
                error: failure,
            },
        )
        .await;
        info!(job_id = %job_id, status = %status, "Generation finished");
        Ok(status)
    }

    async fn generate_all(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        if request.chapters.is_empty() {
            return Err(ChapterflowError::Validation("outline has no chapters".into()).into());
        }

        let last = request.chapters.len() - 1;
        for (n, chapter) in request.chapters.iter().enumerate() {
            self.ensure_active(&request.job_id, cancel).await?;

            let output = self.generate_chapter(request, chapter, cancel).await?;
            let chunk = self.persist(request, chapter.index, output, n == last).await?;

            send(tx, StreamEvent::Chunk(chunk)).await;
        }
        Ok(())
    }

    /// Generate a single chapter through every step
    pub async fn generate_chapter(
        &self,
        request: &GenerationRequest,
        chapter: &ChapterRequest,
        cancel: &CancellationToken,
    ) -> Result<ChapterOutput> {
        debug!(
            job_id = %request.job_id,
            chapter = chapter.index,
            title = %chapter.title,
            "Generating chapter"
        );

        let extraction = self.keywords(request, chapter);
        let keywords = match self.step(GenerationStep::Keywords, cancel, extraction).await {
            Ok(keywords) => keywords,
            Err(e) if is_interruption(&e) => return Err(e),
            Err(e) => {
                warn!(chapter = chapter.index, error = %e, "Keyword extraction failed, using fallback");
                fallback_keywords(request, chapter)
            }
        };
        let query = keywords.join(" ");

        let mut sources: Vec<SearchResult> = Vec::new();
        if let Some(retrieval) = &self.collaborators.retrieval {
            let lookup = retrieval.relevant(&query, &request.session_key, self.retrieval_top_k);
            match self.step(GenerationStep::Retrieval, cancel, lookup).await {
                Ok(passages) => sources.extend(passages.into_iter().map(SearchResult::from)),
                Err(e) if is_interruption(&e) => return Err(e),
                Err(e) => warn!(chapter = chapter.index, error = %e, "Private retrieval failed"),
            }
        }

        if needs_web_search(&sources) {
            if let Some(search) = &self.collaborators.search {
                let lookup = self.search_all(search.as_ref(), &keywords);
                match self.step(GenerationStep::Search, cancel, lookup).await {
                    Ok(results) => sources.extend(results),
                    Err(e) if is_interruption(&e) => return Err(e),
                    Err(e) => warn!(chapter = chapter.index, error = %e, "Web search failed"),
                }
            }
        } else {
            debug!(chapter = chapter.index, "Private content sufficient, skipping web search");
        }

        let prompts = Arc::clone(&self.collaborators.prompts);
        let formatted = format_sources(&sources);
        let prompt = self
            .step(GenerationStep::Prompt, cancel, async {
                Ok(prompts.chapter_prompt(&ChapterContext {
                    topic: &request.topic,
                    outline: &request.outline,
                    chapter_title: &chapter.title,
                    chapter_index: chapter.index,
                    has_subsections: chapter.has_subsections,
                    sources: &formatted,
                }))
            })
            .await?;

        let completion = self.collaborators.model.generate(&prompt);
        let response = self.step(GenerationStep::Model, cancel, completion).await?;

        let (content, references) = self
            .step(GenerationStep::References, cancel, async {
                Ok(process_references(&response, &sources))
            })
            .await?;

        Ok(ChapterOutput {
            content,
            references,
        })
    }

    async fn step<T, F>(
        &self,
        step: GenerationStep,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        run_step(step, self.deadlines.for_step(step), cancel, work).await
    }

    async fn keywords(
        &self,
        request: &GenerationRequest,
        chapter: &ChapterRequest,
    ) -> Result<Vec<String>> {
        let prompts = &self.collaborators.prompts;
        let prompt = prompts.keyword_prompt(&request.topic, &chapter.title);
        let response = self.collaborators.model.generate(&prompt).await?;
        Ok(prompts
            .parse_keywords(&response)
            .unwrap_or_else(|| fallback_keywords(request, chapter)))
    }

    /// Query every keyword concurrently, keeping the first hit per URL
    async fn search_all(
        &self,
        search: &dyn SearchClient,
        keywords: &[String],
    ) -> Result<Vec<SearchResult>> {
        let outcomes = join_all(keywords.iter().map(|keyword| search.query(keyword))).await;

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let mut first_error = None;
        let mut any_ok = false;
        for (keyword, outcome) in keywords.iter().zip(outcomes) {
            match outcome {
                Ok(results) => {
                    any_ok = true;
                    for result in results.into_iter().take(self.search_top_k) {
                        if seen.insert(result.url.clone()) {
                            merged.push(result);
                        }
                    }
                }
                Err(e) => {
                    warn!(keyword = %keyword, error = %e, "Search query failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if !any_ok => Err(e),
            _ => Ok(merged),
        }
    }

    /// Store the chapter as a chunk and, for a bound record, in its slot
    async fn persist(
        &self,
        request: &GenerationRequest,
        index: usize,
        output: ChapterOutput,
        is_final: bool,
    ) -> Result<GenerationChunk> {
        let jobs = self.jobs.clone();
        let records = self.records.clone();
        let job_id = request.job_id.clone();
        let record_id = request.record_id;
        blocking(move || {
            let chunk = jobs.add_chunk(&job_id, &output.content, Some(index), is_final)?;
            if let Some(record_id) = record_id {
                records.update_chapter_references(record_id, index, output.references)?;
                records.set_article_chapter(record_id, index, &output.content)?;
            }
            Ok(chunk)
        })
        .await
    }

    async fn ensure_active(&self, job_id: &str, cancel: &CancellationToken) -> Result<()> {
        let jobs = self.jobs.clone();
        let id = job_id.to_string();
        let flagged = blocking(move || jobs.get_job(&id))
            .await?
            .map(|job| job.status == JobStatus::Canceled)
            .unwrap_or(false);
        if flagged || cancel.is_cancelled() {
            info!(job_id, "Generation canceled");
            return Err(ChapterflowError::Canceled(format!("job {} canceled", job_id)).into());
        }
        Ok(())
    }

    /// Write the terminal status unless another writer already did
    async fn finish(&self, job_id: &str, status: JobStatus) -> Result<JobStatus> {
        let jobs = self.jobs.clone();
        let id = job_id.to_string();
        blocking(move || match jobs.get_job(&id)? {
            Some(job) if job.status.is_terminal() => Ok(job.status),
            Some(_) => {
                jobs.update_status(&id, status, None)?;
                Ok(status)
            }
            None => Err(ChapterflowError::not_found("job", &id).into()),
        })
        .await
    }
}

fn fallback_keywords(request: &GenerationRequest, chapter: &ChapterRequest) -> Vec<String> {
    let mut keywords = vec![chapter.title.clone()];
    if !request.topic.trim().is_empty() {
        keywords.push(request.topic.clone());
    }
    keywords
}

fn needs_web_search(private: &[SearchResult]) -> bool {
    let chars: usize = private
        .iter()
        .flat_map(|source| source.snippets.iter())
        .map(|snippet| snippet.chars().count())
        .sum();
    chars < MIN_PRIVATE_CONTENT_CHARS
}

/// Run a synchronous storage call on the blocking pool
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ChapterflowError::Fatal(format!("storage task failed: {}", e)))?
}

async fn send(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if tx.send(event).await.is_err() {
        debug!("Stream reader gone, continuing without it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::collaborators::RetrievedPassage;
    use crate::storage::SessionStore;
    use crate::test_utils::temp_database;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedModel {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedModel {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if prompt.contains("<begin>") {
                Ok("<begin>[alpha, beta]<end>".to_string())
            } else {
                Ok("Body citing [2].".to_string())
            }
        }
    }

    struct StaticSearch;

    #[async_trait]
    impl SearchClient for StaticSearch {
        async fn query(&self, query: &str) -> Result<Vec<SearchResult>> {
            Ok(vec![SearchResult {
                url: format!("https://example.com/{}", query),
                title: query.to_string(),
                snippets: vec![format!("about {}", query)],
            }])
        }
    }

    struct RichRetrieval;

    #[async_trait]
    impl PrivateRetrieval for RichRetrieval {
        async fn relevant(
            &self,
            _query: &str,
            _key: &str,
            _top_k: usize,
        ) -> Result<Vec<RetrievedPassage>> {
            Ok(vec![RetrievedPassage {
                content: "x".repeat(MIN_PRIVATE_CONTENT_CHARS),
                source: "notes.pdf".into(),
            }])
        }
    }

    fn setup(collaborators: Collaborators) -> (tempfile::TempDir, Database, ChapterWorker) {
        let (dir, db) = temp_database();
        SessionStore::new(db.clone()).get_or_create("u1", 30).unwrap();
        let worker = ChapterWorker::new(db.clone(), collaborators, &GenerationConfig::default());
        (dir, db, worker)
    }

    #[tokio::test]
    async fn test_run_generates_every_chapter() {
        let model = Arc::new(ScriptedModel::new());
        let collaborators = Collaborators::new(model.clone()).with_search(Arc::new(StaticSearch));
        let (_dir, db, worker) = setup(collaborators);
        let record = RecordStore::new(db.clone()).create_record("u1").unwrap();
        let jobs = GenerationJobTracker::new(db.clone());
        let job = jobs.create_job("u1", Some(record.id), Some("T"), None).unwrap();

        let request =
            GenerationRequest::from_outline(&job.id, "u1", Some(record.id), "T", "# Intro\n# Body");
        let (handle, mut rx) = worker.spawn(request, CancellationToken::new());
        let status = handle.await.unwrap().unwrap();
        assert_eq!(status, JobStatus::Succeeded);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[3],
            StreamEvent::Finished {
                status: JobStatus::Succeeded,
                error: None
            }
        );

        let chunks = jobs.get_job_chunks(&job.id, None).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_final_chunk);
        assert!(chunks[1].is_final_chunk);
        assert_eq!(chunks[1].chapter_index, Some(1));
        assert_eq!(chunks[0].content, "Body citing [1].");
        assert!(jobs.is_job_completed(&job.id).unwrap());

        let stored = RecordStore::new(db).get_record(record.id).unwrap().unwrap();
        assert_eq!(stored.article_chapters.len(), 2);
        assert_eq!(stored.references[&0]["1"].url, "https://example.com/beta");
        // one keyword call and one chapter call per chapter
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_regenerated_chapter_replaces_its_slot() {
        let (_dir, db, worker) = setup(Collaborators::new(Arc::new(ScriptedModel::new())));
        let records = RecordStore::new(db.clone());
        let record = records.create_record("u1").unwrap();
        records
            .update_article_chapters(record.id, &["old0".to_string(), "old1".to_string()])
            .unwrap();
        let job = GenerationJobTracker::new(db)
            .create_job("u1", Some(record.id), Some("T"), None)
            .unwrap();

        let request =
            GenerationRequest::from_outline(&job.id, "u1", Some(record.id), "T", "# Intro\n# Body")
                .only_chapter(1);
        assert_eq!(request.chapters.len(), 1);
        let (handle, _rx) = worker.spawn(request, CancellationToken::new());
        assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Succeeded);

        let stored = records.get_record(record.id).unwrap().unwrap();
        assert_eq!(stored.article_chapters, vec!["old0", "Body citing [2]."]);
        assert!(stored.references.contains_key(&1));
        assert!(!stored.references.contains_key(&0));
    }

    #[tokio::test]
    async fn test_storage_waits_do_not_stall_the_runtime() {
        let (_dir, db, worker) = setup(Collaborators::new(Arc::new(ScriptedModel::new())));
        let job = GenerationJobTracker::new(db.clone())
            .create_job("u1", None, Some("T"), None)
            .unwrap();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let holder_db = db.clone();
        let holder = std::thread::spawn(move || {
            let mut conn = holder_db.connection().unwrap();
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .unwrap();
            ready_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(400));
            drop(tx);
        });
        ready_rx.recv().unwrap();

        let request = GenerationRequest::from_outline(&job.id, "u1", None, "T", "# Only");
        let (handle, _rx) = worker.spawn(request, CancellationToken::new());

        // this single-threaded runtime keeps ticking while the worker waits on the lock
        let mut ticks = 0;
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ticks += 1;
        }
        assert!(ticks >= 5, "runtime stalled, only {} ticks", ticks);
        assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Succeeded);
        holder.join().unwrap();
    }

    #[test]
    fn test_starting_at_skips_earlier_chapters() {
        let request = GenerationRequest::from_outline("j", "u1", None, "T", "# A\n# B\n# C")
            .starting_at(1);
        let titles: Vec<&str> = request.chapters.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["B", "C"]);
        assert_eq!(request.chapters[0].index, 1);
    }

    #[tokio::test]
    async fn test_rich_private_content_skips_search() {
        let collaborators = Collaborators::new(Arc::new(ScriptedModel::new()))
            .with_retrieval(Arc::new(RichRetrieval))
            .with_search(Arc::new(StaticSearch));
        let (_dir, db, worker) = setup(collaborators);
        let job = GenerationJobTracker::new(db)
            .create_job("u1", None, Some("T"), None)
            .unwrap();
        let request = GenerationRequest::from_outline(&job.id, "u1", None, "T", "# Only");

        let output = worker
            .generate_chapter(&request, &request.chapters[0], &CancellationToken::new())
            .await
            .unwrap();

        // [2] points past the single private source, so nothing is cited
        assert_eq!(output.content, "Body citing [2].");
        assert!(output.references.is_empty());
    }

    #[tokio::test]
    async fn test_model_timeout_fails_job() {
        let model = Arc::new(ScriptedModel {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let (_dir, db, worker) = setup(Collaborators::new(model));
        let worker = worker.with_deadlines(StepDeadlines::uniform(Duration::from_millis(20)));
        let jobs = GenerationJobTracker::new(db);
        let job = jobs.create_job("u1", None, Some("T"), None).unwrap();

        let request = GenerationRequest::from_outline(&job.id, "u1", None, "T", "# A");
        let (handle, mut rx) = worker.spawn(request, CancellationToken::new());
        let status = handle.await.unwrap().unwrap();

        assert_eq!(status, JobStatus::Failed);
        assert!(jobs.get_job_chunks(&job.id, None).unwrap().is_empty());
        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        match last {
            Some(StreamEvent::Finished { status, error }) => {
                assert_eq!(status, JobStatus::Failed);
                assert!(error.unwrap().contains("timed out"));
            }
            other => panic!("unexpected last event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_canceled_token_stops_before_first_chapter() {
        let (_dir, db, worker) = setup(Collaborators::new(Arc::new(ScriptedModel::new())));
        let jobs = GenerationJobTracker::new(db);
        let job = jobs.create_job("u1", None, Some("T"), None).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let request = GenerationRequest::from_outline(&job.id, "u1", None, "T", "# A\n# B");
        let (handle, _rx) = worker.spawn(request, token);

        assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Canceled);
        assert_eq!(jobs.get_job(&job.id).unwrap().unwrap().status, JobStatus::Canceled);
        assert!(jobs.get_job_chunks(&job.id, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_reader_keeps_content() {
        let (_dir, db, worker) = setup(Collaborators::new(Arc::new(ScriptedModel::new())));
        let jobs = GenerationJobTracker::new(db);
        let job = jobs.create_job("u1", None, Some("T"), None).unwrap();

        let request = GenerationRequest::from_outline(&job.id, "u1", None, "T", "# A\n# B");
        let (handle, rx) = worker.spawn(request, CancellationToken::new());
        drop(rx);

        assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Succeeded);
        assert_eq!(
            jobs.get_job_content(&job.id).unwrap(),
            "Body citing [2].Body citing [2]."
        );
    }

    #[tokio::test]
    async fn test_empty_outline_fails() {
        let (_dir, db, worker) = setup(Collaborators::new(Arc::new(ScriptedModel::new())));
        let jobs = GenerationJobTracker::new(db);
        let job = jobs.create_job("u1", None, Some("T"), None).unwrap();

        let request = GenerationRequest::from_outline(&job.id, "u1", None, "T", "no headings");
        let (tx, _rx) = mpsc::channel(STREAM_BUFFER);
        let status = worker.run(request, CancellationToken::new(), tx).await.unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_job_is_error() {
        let (_dir, _db, worker) = setup(Collaborators::new(Arc::new(ScriptedModel::new())));
        let request = GenerationRequest::from_outline("missing", "u1", None, "T", "# A");
        let (tx, _rx) = mpsc::channel(STREAM_BUFFER);
        assert!(worker.run(request, CancellationToken::new(), tx).await.is_err());
    }
}
