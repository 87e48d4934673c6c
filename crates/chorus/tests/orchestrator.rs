use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use chorus::{
    errors::ChorusError,
    models::{
        event::{Event, OutputEnvelope},
        message::Message,
    },
    orchestrator::Orchestrator,
    providers::{base::ProviderAdapter, factory::BackendKind},
    session::Conversation,
};
use futures::stream::{BoxStream, StreamExt};
use tokio::time::{sleep, timeout};

#[derive(Clone)]
enum Step {
    Emit(Event),
    Pause(Duration),
    Hang,
    Panic,
}

/// Sets its flag when the turn future holding it is dropped
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Adapter that plays back a fixed list of steps every turn
struct ScriptedAdapter {
    script: Vec<Step>,
    conversation: Mutex<Conversation>,
    dropped: Arc<AtomicBool>,
}

impl ScriptedAdapter {
    fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            conversation: Mutex::new(Conversation::new("system")),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn initiate_turn(self: Arc<Self>, user_message: String) -> BoxStream<'static, Event> {
        Box::pin(stream! {
            let _flag = DropFlag(self.dropped.clone());
            self.conversation.lock().unwrap().push(Message::user().with_text(user_message));
            for step in self.script.clone() {
                match step {
                    Step::Emit(event) => yield event,
                    Step::Pause(duration) => sleep(duration).await,
                    Step::Hang => futures::future::pending::<()>().await,
                    Step::Panic => panic!("scripted adapter failure"),
                }
            }
            self.conversation.lock().unwrap().push(Message::assistant().with_text("done"));
        })
    }

    fn conversation(&self) -> Conversation {
        self.conversation.lock().unwrap().clone()
    }

    fn reset(&self) {
        *self.conversation.lock().unwrap() = Conversation::new("system");
    }
}

/// Orchestrator over scripted backends, counting how often each factory runs
fn orchestrator(scripts: Vec<(&str, Vec<Step>)>) -> (Orchestrator, Arc<AtomicUsize>, Vec<Arc<ScriptedAdapter>>) {
    let created = Arc::new(AtomicUsize::new(0));
    let mut adapters = Vec::new();
    let mut builder = Orchestrator::builder();
    for (id, script) in scripts {
        let adapter = Arc::new(ScriptedAdapter::new(script));
        adapters.push(adapter.clone());
        let created = created.clone();
        builder = builder.backend(id, format!("label-{}", id), move || {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(adapter.clone() as Arc<dyn ProviderAdapter>)
        });
    }
    (builder.build(), created, adapters)
}

fn of(envelopes: &[OutputEnvelope], label: &str) -> Vec<Event> {
    envelopes
        .iter()
        .filter(|e| e.source == label)
        .map(|e| e.payload.clone())
        .collect()
}

fn normal_script(prefix: &str) -> Vec<Step> {
    vec![
        Step::Emit(Event::text(format!("{} one", prefix))),
        Step::Pause(Duration::from_millis(20)),
        Step::Emit(Event::text(format!("{} two", prefix))),
        Step::Emit(Event::End),
    ]
}

#[tokio::test]
async fn test_every_backend_answers() -> Result<()> {
    let (orchestrator, created, _) =
        orchestrator(vec![("a", normal_script("a")), ("b", normal_script("b"))]);

    let merged: Vec<OutputEnvelope> = orchestrator.handle_turn("hello", None)?.collect().await;

    for label in ["label-a", "label-b"] {
        let prefix = &label[6..];
        assert_eq!(
            of(&merged, label),
            vec![
                Event::text(format!("{} one", prefix)),
                Event::text(format!("{} two", prefix)),
                Event::End
            ]
        );
    }
    assert_eq!(merged.len(), 6);
    assert_eq!(orchestrator.spawned_tasks(), 2);
    assert_eq!(created.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_output_is_interleaved_by_readiness() -> Result<()> {
    let slow = vec![
        Step::Pause(Duration::from_millis(200)),
        Step::Emit(Event::text("slow")),
        Step::Emit(Event::End),
    ];
    let (orchestrator, _, _) = orchestrator(vec![("slow", slow), ("fast", normal_script("fast"))]);

    let merged: Vec<OutputEnvelope> = orchestrator.handle_turn("hello", None)?.collect().await;
    let sources: Vec<&str> = merged.iter().map(|e| e.source.as_str()).collect();
    assert_eq!(
        sources,
        vec!["label-fast", "label-fast", "label-fast", "label-slow", "label-slow"]
    );
    Ok(())
}

#[tokio::test]
async fn test_requested_subset() -> Result<()> {
    let (orchestrator, created, _) =
        orchestrator(vec![("a", normal_script("a")), ("b", normal_script("b"))]);

    let requested = vec!["b".to_string(), "nope".to_string()];
    let merged: Vec<OutputEnvelope> = orchestrator
        .handle_turn("hello", Some(&requested))?
        .collect()
        .await;

    assert!(merged.iter().all(|e| e.source == "label-b"));
    assert_eq!(merged.len(), 3);
    assert_eq!(orchestrator.spawned_tasks(), 1);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_unknown_backends_spawn_nothing() {
    let (orchestrator, created, _) =
        orchestrator(vec![("a", normal_script("a")), ("b", normal_script("b"))]);

    let requested = vec!["gemini".to_string(), "mistral".to_string()];
    let result = orchestrator.handle_turn("hello", Some(&requested));

    assert!(matches!(result, Err(ChorusError::InvalidRequest(_))));
    assert_eq!(orchestrator.spawned_tasks(), 0);
    assert_eq!(created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failing_backend_does_not_affect_others() -> Result<()> {
    let broken = vec![Step::Emit(Event::text("partial")), Step::Panic];
    let (orchestrator, _, _) =
        orchestrator(vec![("broken", broken), ("b", normal_script("b"))]);
    let (alone, _, _) = orchestrator_alone();

    let merged: Vec<OutputEnvelope> = orchestrator.handle_turn("hello", None)?.collect().await;
    let baseline: Vec<OutputEnvelope> = alone.handle_turn("hello", None)?.collect().await;

    assert_eq!(of(&merged, "label-b"), of(&baseline, "label-b"));
    assert_eq!(
        of(&merged, "label-broken"),
        vec![
            Event::text("partial"),
            Event::error("Internal error: backend task panicked")
        ]
    );
    Ok(())
}

fn orchestrator_alone() -> (Orchestrator, Arc<AtomicUsize>, Vec<Arc<ScriptedAdapter>>) {
    orchestrator(vec![("b", normal_script("b"))])
}

#[tokio::test]
async fn test_dropping_the_stream_cancels_backends() -> Result<()> {
    let hanging = vec![Step::Emit(Event::text("thinking")), Step::Hang];
    let (orchestrator, _, adapters) = orchestrator(vec![("a", hanging)]);

    let mut merged = orchestrator.handle_turn("hello", None)?;
    let first = timeout(Duration::from_secs(1), merged.next()).await?;
    assert_eq!(first, Some(OutputEnvelope::new("label-a", Event::text("thinking"))));
    assert!(!adapters[0].dropped.load(Ordering::SeqCst));

    drop(merged);
    timeout(Duration::from_secs(1), async {
        while !adapters[0].dropped.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_adapters_are_reused_until_reset() -> Result<()> {
    let (orchestrator, created, _) = orchestrator(vec![("a", normal_script("a"))]);

    orchestrator.handle_turn("first", None)?.collect::<Vec<_>>().await;
    orchestrator.handle_turn("second", None)?.collect::<Vec<_>>().await;
    assert_eq!(created.load(Ordering::SeqCst), 1);

    let conversation = orchestrator.conversation("a").expect("adapter exists");
    let texts: Vec<String> = conversation.history().iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["first", "done", "second", "done"]);

    assert!(orchestrator.reset("a"));
    assert!(orchestrator.conversation("a").expect("adapter exists").is_empty());
    assert!(!orchestrator.reset("b"));

    orchestrator.handle_turn("third", None)?.collect::<Vec<_>>().await;
    assert_eq!(orchestrator.conversation("a").expect("adapter exists").len(), 2);
    orchestrator.reset_all();
    assert!(orchestrator.conversation("a").expect("adapter exists").is_empty());
    assert_eq!(created.load(Ordering::SeqCst), 1);
    Ok(())
}
