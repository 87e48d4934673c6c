use async_stream::stream;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::errors::ChorusError;
use crate::models::event::{Event, OutputEnvelope};

const SOURCE_BUFFER: usize = 32;

/// One backend's event sequence as the multiplexer sees it. An `Err` item
/// means fetching from the source failed; the source is finished after it.
pub type EventSource = BoxStream<'static, Result<Event, ChorusError>>;

/// Tag every event of one source with its label.
///
/// The labelled stream stops right after the first terminal event, turns a
/// failed fetch into an `Error` for this source only, and ends quietly when the
/// source runs dry. Empty text deltas are dropped.
pub fn label_source<S>(label: String, events: S) -> BoxStream<'static, OutputEnvelope>
where
    S: Stream<Item = Result<Event, ChorusError>> + Send + 'static,
{
    Box::pin(stream! {
        futures::pin_mut!(events);
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(Event::TextDelta { text }) if text.is_empty() => continue,
                Ok(event) => event,
                Err(e) => {
                    error!("Source {} failed: {}", label, e);
                    yield OutputEnvelope::new(label.clone(), Event::error(e.to_string()));
                    break;
                }
            };
            let terminal = event.is_terminal();
            yield OutputEnvelope::new(label.clone(), event);
            if terminal {
                break;
            }
        }
        debug!("Source {} exhausted", label);
    })
}

/// Merge labelled sources into one stream, yielding whichever item is ready
/// first. Ends once every source has ended.
pub fn merge(sources: Vec<(String, EventSource)>) -> BoxStream<'static, OutputEnvelope> {
    if sources.is_empty() {
        return stream::empty().boxed();
    }
    let labelled = sources
        .into_iter()
        .map(|(label, events)| label_source(label, events));
    stream::select_all(labelled).boxed()
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drive an event stream on its own tokio task.
///
/// Dropping the returned source aborts the task, and a panic inside it comes
/// back as an `Err` item.
pub fn spawn_source<S>(events: S) -> EventSource
where
    S: Stream<Item = Event> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(SOURCE_BUFFER);
    let handle = tokio::spawn(async move {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    let mut task = AbortOnDrop(handle);

    Box::pin(stream! {
        let mut received = ReceiverStream::new(rx);
        while let Some(event) = received.next().await {
            yield Ok(event);
        }
        if let Err(e) = (&mut task.0).await {
            if e.is_panic() {
                yield Err(ChorusError::Internal("backend task panicked".to_string()));
            }
        }
    })
}
