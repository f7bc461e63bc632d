use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use story2picturebook::clients::{create_identity_provider, create_image_model, create_text_model};
use story2picturebook::config::Config;
use story2picturebook::frame::{FrameParser, StreamEvent};
use story2picturebook::images::{ImageOrchestrator, PageStatus};
use story2picturebook::relay::{GenerateService, RelayOutcome, StoryRequest};
use story2picturebook::session::{GenerationSession, GenerationStatus, ProgressKind, ProgressSink};
use story2picturebook::store::{NativeStorage, TaleStore};

/// Progress sink that drives a terminal spinner.
struct SpinnerSink {
    bar: ProgressBar,
}

impl SpinnerSink {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
        bar.enable_steady_tick(Duration::from_millis(120));
        Ok(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for SpinnerSink {
    fn progress(&self, message: &str, kind: ProgressKind) {
        match kind {
            ProgressKind::Info => self.bar.set_message(message.to_string()),
            _ => self.bar.println(message),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let story_path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("Usage: story2picturebook <story.txt> [page_count]");
            std::process::exit(2);
        }
    };
    let page_count: usize = match args.next() {
        Some(n) => n.parse().context("page_count must be a number")?,
        None => 8,
    };

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM and image settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    let story = tokio::fs::read_to_string(&story_path)
        .await
        .with_context(|| format!("Failed to read story file {}", story_path))?;

    let identity = create_identity_provider(&config)?;
    let text_model = create_text_model(&config)?;
    let image_model = create_image_model(&config)?;

    let store = Arc::new(TaleStore::new(Arc::new(NativeStorage::new()), &config.tales_root));
    let service = GenerateService::new(identity, text_model, store.clone(), config.relay.options());

    let bearer = std::env::var("STORYBOOK_TOKEN").unwrap_or_default();

    // One abort context for the whole session; Ctrl-C trips it.
    let mut session = GenerationSession::new();
    let abort = session.abort.clone();
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                abort.abort();
            }
        });
    }

    let sink = SpinnerSink::new()?;

    // Phase 1: stream the tale out of the text model, consumed off the wire
    // exactly as a remote client would see it.
    session.status = GenerationStatus::Connecting;
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
    let request = StoryRequest {
        story,
        page_count,
        aspect_ratio: config.image.aspect_ratio.clone(),
    };

    let relay = {
        let abort = abort.clone();
        tokio::spawn(async move { service.handle_wire(request, &bearer, tx, &abort).await })
    };

    let show = |event: StreamEvent| match event {
        StreamEvent::Progress { message, percent } => {
            sink.progress(&format!("{} ({}%)", message, percent), ProgressKind::Info);
        }
        StreamEvent::PartialContent { text } => {
            debug!("partial content: {} bytes", text.len());
        }
        StreamEvent::Complete { id } => {
            sink.progress(&format!("Story saved as {}", id), ProgressKind::Success);
        }
        StreamEvent::Error { message } => {
            sink.progress(&message, ProgressKind::Failure);
        }
    };

    let mut parser = FrameParser::new();
    while let Some(chunk) = rx.recv().await {
        for event in parser.push(&chunk) {
            show(event);
        }
    }
    if let Some(event) = parser.finish() {
        show(event);
    }

    let outcome = relay.await.context("relay task panicked")?;
    let (id, user_id) = match outcome {
        RelayOutcome::Complete { id, user_id } => (id, user_id),
        RelayOutcome::Aborted => {
            session.status = GenerationStatus::Aborted;
            sink.finish();
            println!("Cancelled.");
            return Ok(());
        }
        RelayOutcome::Failed { message } => {
            session.status = GenerationStatus::Error;
            sink.finish();
            anyhow::bail!("story generation failed: {}", message);
        }
    };

    // Phase 2: illustrate the saved tale, one page at a time.
    session.status = GenerationStatus::Generating;
    let tale = store.get(&user_id, &id).await?;
    println!("\"{}\": {} pages", tale.title, tale.pages.len());

    let orchestrator = ImageOrchestrator::new(
        image_model,
        config.image.run_config(),
        &tale.pages,
        &tale.characters,
    );
    let summary = orchestrator.run(&abort, &sink).await;
    session.status = if abort.is_aborted() {
        GenerationStatus::Aborted
    } else {
        GenerationStatus::Complete
    };
    sink.finish();

    for page in orchestrator.snapshot().await {
        match page.status {
            PageStatus::Success => {
                let url = page.image_url.unwrap_or_default();
                println!("  page {}: {}", page.index + 1, url);
            }
            PageStatus::Error => {
                let message = page.error_message.unwrap_or_default();
                println!("  page {}: FAILED. {}", page.index + 1, message);
                if let Some(details) = page.error_details {
                    println!("    {}", details);
                }
            }
            _ => println!("  page {}: not generated", page.index + 1),
        }
    }

    println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
    debug!("session finished with status {:?}", session.status);
    Ok(())
}
