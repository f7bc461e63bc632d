use anyhow::Result;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::frame::{encode_frame, StreamEvent, DATA_PREFIX, STREAM_DONE};
use crate::reassembly::{recover_from_lines, reassemble_tale, ReassemblyError};
use crate::session::AbortHandle;
use crate::store::TaleStore;
use crate::tale::TaleParseError;

/// What the caller submits to start a generation session.
#[derive(Debug, Clone)]
pub struct StoryRequest {
    pub story: String,
    pub page_count: usize,
    pub aspect_ratio: String,
}

/// The single streaming request sent upstream.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_instructions: String,
    pub story: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Structured-output mode: the model must answer in JSON.
    pub response_mime_type: String,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verifies a bearer credential and returns the caller's user id.
    async fn verify(&self, bearer: &str) -> Result<String>;
}

#[async_trait]
pub trait TextModelClient: Send + Sync {
    async fn stream_generate(&self, request: &GenerateRequest) -> Result<ByteStream>;
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Emit a progress frame on the first chunk and every Nth thereafter.
    pub progress_every_n_chunks: u64,
    /// Coarse percentage per chunk, capped at 90 until assembly.
    pub pct_per_chunk: u64,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            progress_every_n_chunks: 5,
            pct_per_chunk: 3,
            temperature: 0.2,
            max_output_tokens: 8192,
        }
    }
}

/// How a relay session ended. Failures were already surfaced to the caller as
/// an `error` frame; cancellation is terminal but not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Complete { id: String, user_id: String },
    Aborted,
    Failed { message: String },
}

/// Server-side streaming orchestrator: authenticates the caller, drives the
/// upstream streaming call, relays coarse progress, reassembles the result
/// and persists it.
pub struct GenerateService {
    identity: Arc<dyn IdentityProvider>,
    model: Arc<dyn TextModelClient>,
    store: Arc<TaleStore>,
    options: RelayOptions,
}

impl GenerateService {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        model: Arc<dyn TextModelClient>,
        store: Arc<TaleStore>,
        options: RelayOptions,
    ) -> Self {
        Self { identity, model, store, options }
    }

    pub async fn handle(
        &self,
        request: StoryRequest,
        bearer: &str,
        sink: mpsc::Sender<StreamEvent>,
        abort: &AbortHandle,
    ) -> RelayOutcome {
        // Auth first; a bad credential gets one error frame and no retry.
        let user_id = match self.identity.verify(bearer).await {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!("credential verification failed: {:#}", e);
                return self.fail(&sink, "Authentication failed. Please sign in again.").await;
            }
        };

        let generate_request = self.build_generate_request(&request);
        let mut stream = match self.model.stream_generate(&generate_request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("upstream connect failed: {:#}", e);
                return self.fail(&sink, "Could not reach the story model.").await;
            }
        };

        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk_count: u64 = 0;

        loop {
            let item = tokio::select! {
                biased;
                _ = abort.aborted() => {
                    info!("generation aborted after {} chunks", chunk_count);
                    return RelayOutcome::Aborted;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else { break };

            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("stream transport failure: {:#}", e);
                    return self.fail(&sink, "The story stream was interrupted.").await;
                }
            };

            chunk_count += 1;
            if chunk_count == 1 || chunk_count % self.options.progress_every_n_chunks == 0 {
                let percent = (chunk_count * self.options.pct_per_chunk).min(90) as u8;
                let message = if chunk_count == 1 {
                    "The story model is writing...".to_string()
                } else {
                    format!("Still writing your story ({}%)", percent)
                };
                self.emit(&sink, StreamEvent::Progress { message, percent }).await;
            }

            // Best-effort partial extraction; failures here are silent.
            let text = recover_from_lines(&String::from_utf8_lossy(&chunk));
            if !text.is_empty() {
                self.emit(&sink, StreamEvent::PartialContent { text }).await;
            }

            // The full buffer accumulates every raw byte no matter what the
            // per-chunk parse did.
            buffer.extend_from_slice(&chunk);
        }

        debug!("upstream stream ended after {} chunks, {} bytes", chunk_count, buffer.len());
        self.emit(
            &sink,
            StreamEvent::Progress { message: "Assembling your storybook...".to_string(), percent: 90 },
        )
        .await;

        let raw = String::from_utf8_lossy(&buffer);
        let tale = match reassemble_tale(&raw) {
            Ok(tale) => tale,
            Err(ReassemblyError::NoContent) => {
                return self.fail(&sink, "The story model produced no content. Please try again.").await;
            }
            Err(ReassemblyError::Tale(TaleParseError::MissingPages)) => {
                return self.fail(&sink, "The generated story had no pages. Please try again.").await;
            }
            Err(e) => {
                warn!("tale validation failed: {:#}", e);
                return self.fail(&sink, "The generated story could not be read. Please try again.").await;
            }
        };

        let id = match self.store.save(&user_id, &tale).await {
            Ok(id) => id,
            Err(e) => {
                warn!("tale save failed: {:#}", e);
                return self.fail(&sink, "The story could not be saved. Please try again.").await;
            }
        };

        self.emit(&sink, StreamEvent::Complete { id: id.clone() }).await;
        RelayOutcome::Complete { id, user_id }
    }

    /// Wire variant of [`handle`](Self::handle): every event is encoded as a
    /// `"data: " + JSON + "\n"` frame and pushed to the byte sink, followed by
    /// the end sentinel once the session is over. Consumers reverse this with
    /// [`FrameParser`](crate::frame::FrameParser).
    pub async fn handle_wire(
        &self,
        request: StoryRequest,
        bearer: &str,
        sink: mpsc::Sender<Vec<u8>>,
        abort: &AbortHandle,
    ) -> RelayOutcome {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(32);

        let forward = async {
            while let Some(event) = rx.recv().await {
                match encode_frame(&event) {
                    Ok(frame) => {
                        if sink.send(frame.into_bytes()).await.is_err() {
                            debug!("caller went away, wire frame dropped");
                        }
                    }
                    Err(e) => warn!("frame encode failed: {:#}", e),
                }
            }
            let sentinel = format!("{}{}\n", DATA_PREFIX, STREAM_DONE);
            let _ = sink.send(sentinel.into_bytes()).await;
        };

        let (outcome, ()) = tokio::join!(self.handle(request, bearer, tx, abort), forward);
        outcome
    }

    fn build_generate_request(&self, request: &StoryRequest) -> GenerateRequest {
        GenerateRequest {
            system_instructions: story_system_prompt(request.page_count, &request.aspect_ratio),
            story: request.story.clone(),
            temperature: self.options.temperature,
            max_output_tokens: self.options.max_output_tokens,
            response_mime_type: "application/json".to_string(),
        }
    }

    async fn emit(&self, sink: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
        if sink.send(event).await.is_err() {
            debug!("caller went away, frame dropped");
        }
    }

    async fn fail(&self, sink: &mpsc::Sender<StreamEvent>, message: &str) -> RelayOutcome {
        self.emit(sink, StreamEvent::Error { message: message.to_string() }).await;
        RelayOutcome::Failed { message: message.to_string() }
    }
}

/// System instructions for the text model: a complete JSON storybook document
/// with per-page illustration prompts and a character sheet for continuity.
fn story_system_prompt(page_count: usize, aspect_ratio: &str) -> String {
    format!(
        "You are a children's storybook author and art director. \
         Turn the user's story idea into a picture book of exactly {page_count} pages. \
         Respond with a single JSON object and nothing else, using this shape: \
         {{\"title\": string, \
         \"characters\": {{name: {{\"appearance\": string, \"clothing\": string, \"personality\": string}}}}, \
         \"pages\": [{{\"index\": number (0-based), \"text\": string, \
         \"imagePrompt\": string describing the illustration without naming text or writing, \
         \"sceneType\": one of \"none\" | \"lead\" | \"supporting\" | \"ensemble\", \
         \"sceneCharacters\": [names appearing in the scene]}}]}}. \
         Every character mentioned in a sceneCharacters list must exist in characters. \
         Compose each imagePrompt for a {aspect_ratio} illustration."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameParser;
    use crate::store::Storage;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockIdentity {
        accept: bool,
    }

    #[async_trait]
    impl IdentityProvider for MockIdentity {
        async fn verify(&self, bearer: &str) -> Result<String> {
            if self.accept && bearer == "token-1" {
                Ok("user-1".to_string())
            } else {
                Err(anyhow!("invalid credential"))
            }
        }
    }

    /// Streams a canned upstream dump in fixed-size chunks.
    struct MockTextModel {
        dump: Vec<u8>,
        chunk_size: usize,
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl TextModelClient for MockTextModel {
        async fn stream_generate(&self, request: &GenerateRequest) -> Result<ByteStream> {
            *self.calls.lock().unwrap() += 1;
            assert_eq!(request.response_mime_type, "application/json");
            assert!(request.temperature <= 0.5);
            let chunks: Vec<Result<Vec<u8>>> = self
                .dump
                .chunks(self.chunk_size)
                .map(|c| Ok(c.to_vec()))
                .collect();
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }
    }

    #[derive(Default)]
    struct MemoryStorage {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl Storage for MemoryStorage {
        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            self.blobs
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("missing blob {}", path))
        }
        async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
            self.blobs.lock().unwrap().insert(path.to_string(), content.to_vec());
            Ok(())
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            Ok(self.blobs.lock().unwrap().contains_key(path))
        }
    }

    fn upstream_dump(doc: &str) -> Vec<u8> {
        // A whole-array Gemini-style dump, text split across three frames.
        let thirds = doc.len() / 3;
        let (a, rest) = doc.split_at(thirds);
        let (b, c) = rest.split_at(thirds);
        let frame = |text: &str| {
            format!(
                r#"{{"candidates":[{{"content":{{"parts":[{{"text":{}}}]}}}}]}}"#,
                serde_json::to_string(text).unwrap()
            )
        };
        format!("[{},{},{}]", frame(a), frame(b), frame(c)).into_bytes()
    }

    fn three_page_doc() -> String {
        r#"{"title":"The Fox","characters":{"Fox":{"appearance":"red fox","clothing":"scarf","personality":"curious"}},"pages":[
            {"index":0,"text":"a","imagePrompt":"p0","sceneType":"lead","sceneCharacters":["Fox"]},
            {"index":1,"text":"b","imagePrompt":"p1","sceneType":"none","sceneCharacters":[]},
            {"index":2,"text":"c","imagePrompt":"p2","sceneType":"lead","sceneCharacters":["Fox"]}]}"#
            .to_string()
    }

    fn service(dump: Vec<u8>, accept: bool) -> (GenerateService, Arc<TaleStore>, Arc<Mutex<usize>>) {
        let calls = Arc::new(Mutex::new(0));
        let store = Arc::new(TaleStore::new(Arc::new(MemoryStorage::default()), "tales"));
        let service = GenerateService::new(
            Arc::new(MockIdentity { accept }),
            Arc::new(MockTextModel { dump, chunk_size: 24, calls: calls.clone() }),
            store.clone(),
            RelayOptions::default(),
        );
        (service, store, calls)
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_end_to_end_three_pages() {
        let (service, store, _) = service(upstream_dump(&three_page_doc()), true);
        let (tx, rx) = mpsc::channel(64);

        let request = StoryRequest {
            story: "a fox finds a lantern".to_string(),
            page_count: 3,
            aspect_ratio: "1:1".to_string(),
        };
        let outcome = service.handle(request, "token-1", tx, &AbortHandle::new()).await;
        let events = drain(rx).await;

        let RelayOutcome::Complete { id, user_id } = outcome else {
            panic!("expected completion, got {:?}", outcome)
        };
        assert_eq!(user_id, "user-1", "outcome carries the verified user id");

        // Progress frames first, exactly one complete frame last.
        assert!(matches!(events.first(), Some(StreamEvent::Progress { .. })));
        assert!(events.iter().filter(|e| matches!(e, StreamEvent::Complete { .. })).count() == 1);
        assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));

        // Retrieval by the opaque id returns the tale, index order preserved.
        let tale = store.get(&user_id, &id).await.unwrap();
        assert_eq!(tale.pages.len(), 3);
        assert_eq!(
            tale.pages.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_progress_percent_is_capped_at_ninety() {
        let (service, _, _) = service(upstream_dump(&three_page_doc()), true);
        let (tx, rx) = mpsc::channel(64);
        let request = StoryRequest { story: "s".to_string(), page_count: 3, aspect_ratio: "1:1".to_string() };
        service.handle(request, "token-1", tx, &AbortHandle::new()).await;
        for event in drain(rx).await {
            if let StreamEvent::Progress { percent, .. } = event {
                assert!(percent <= 90);
            }
        }
    }

    #[tokio::test]
    async fn test_auth_failure_emits_error_frame_and_skips_model() {
        let (service, _, calls) = service(upstream_dump(&three_page_doc()), false);
        let (tx, rx) = mpsc::channel(8);
        let request = StoryRequest { story: "s".to_string(), page_count: 1, aspect_ratio: "1:1".to_string() };

        let outcome = service.handle(request, "bad-token", tx, &AbortHandle::new()).await;
        assert!(matches!(outcome, RelayOutcome::Failed { .. }));

        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { message } if message.contains("Authentication")));
        assert_eq!(*calls.lock().unwrap(), 0, "model must not be called");
    }

    #[tokio::test]
    async fn test_empty_upstream_is_no_content_error() {
        let (service, _, _) = service(b"[]".to_vec(), true);
        let (tx, rx) = mpsc::channel(8);
        let request = StoryRequest { story: "s".to_string(), page_count: 1, aspect_ratio: "1:1".to_string() };

        let outcome = service.handle(request, "token-1", tx, &AbortHandle::new()).await;
        assert!(matches!(outcome, RelayOutcome::Failed { ref message } if message.contains("no content")));
        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(StreamEvent::Error { message }) if message.contains("no content")));
    }

    #[tokio::test]
    async fn test_missing_pages_is_a_distinct_failure() {
        let (service, _, _) = service(upstream_dump(r#"{"title":"no pages here......"}"#), true);
        let (tx, rx) = mpsc::channel(8);
        let request = StoryRequest { story: "s".to_string(), page_count: 1, aspect_ratio: "1:1".to_string() };

        let outcome = service.handle(request, "token-1", tx, &AbortHandle::new()).await;
        assert!(matches!(outcome, RelayOutcome::Failed { ref message } if message.contains("no pages")));
        let _ = drain(rx).await;
    }

    #[tokio::test]
    async fn test_pre_aborted_session_stops_before_any_frame_work() {
        let (service, _, _) = service(upstream_dump(&three_page_doc()), true);
        let (tx, rx) = mpsc::channel(64);
        let abort = AbortHandle::new();
        abort.abort();

        let request = StoryRequest { story: "s".to_string(), page_count: 3, aspect_ratio: "1:1".to_string() };
        let outcome = service.handle(request, "token-1", tx, &abort).await;
        assert_eq!(outcome, RelayOutcome::Aborted);

        // No complete and no error frame: cancellation is not a failure.
        let events = drain(rx).await;
        assert!(!events.iter().any(|e| {
            matches!(e, StreamEvent::Complete { .. }) || matches!(e, StreamEvent::Error { .. })
        }));
    }

    #[tokio::test]
    async fn test_partial_content_frames_are_best_effort() {
        // Chunk size slices frames mid-JSON, so most chunks yield nothing;
        // the session must still complete from the accumulated buffer.
        let (service, store, _) = service(upstream_dump(&three_page_doc()), true);
        let (tx, rx) = mpsc::channel(64);
        let request = StoryRequest { story: "s".to_string(), page_count: 3, aspect_ratio: "1:1".to_string() };
        let outcome = service.handle(request, "token-1", tx, &AbortHandle::new()).await;
        let RelayOutcome::Complete { id, .. } = outcome else { panic!() };
        assert!(store.get("user-1", &id).await.is_ok());
        drop(rx);
    }

    #[tokio::test]
    async fn test_wire_output_is_framed_and_parses_back() {
        let (service, _, _) = service(upstream_dump(&three_page_doc()), true);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        let request = StoryRequest { story: "s".to_string(), page_count: 3, aspect_ratio: "1:1".to_string() };

        let outcome = service.handle_wire(request, "token-1", tx, &AbortHandle::new()).await;
        assert!(matches!(outcome, RelayOutcome::Complete { .. }));

        let mut wire = Vec::new();
        while let Some(chunk) = rx.recv().await {
            wire.extend_from_slice(&chunk);
        }

        // Every line is a marker-prefixed record, closed by the end sentinel.
        let text = String::from_utf8(wire.clone()).unwrap();
        assert!(text.lines().all(|l| l.starts_with(DATA_PREFIX)));
        assert!(text.ends_with("data: [DONE]\n"));

        // Feeding the bytes back through the parser in awkward chunk sizes
        // recovers the same event sequence the session emitted.
        let mut parser = FrameParser::new();
        let mut events = Vec::new();
        for chunk in wire.chunks(7) {
            events.extend(parser.push(chunk));
        }
        events.extend(parser.finish());

        assert!(matches!(events.first(), Some(StreamEvent::Progress { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
    }
}
