//! Record-batch stream abstractions and queue adapters.
//!
//! A [`SendableRecordBatchStream`] is the batch-generator protocol of the
//! engine: the source node consumes one to inject data into the graph, the
//! sink node exposes one to extract data out of it.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use brook_common::Result;
use futures::Stream;

/// A stream of record batches that also knows its output schema.
pub trait RecordBatchStream: Stream<Item = Result<RecordBatch>> + Send {
    /// Output schema for every batch yielded by this stream.
    fn schema(&self) -> SchemaRef;
}

/// The standard "async batch generator" handle.
pub type SendableRecordBatchStream = Pin<Box<dyn RecordBatchStream>>;

/// Adapter that attaches a schema to any `Stream<Item = Result<RecordBatch>>`.
pub struct StreamAdapter<S> {
    schema: SchemaRef,
    inner: S,
}

impl<S> StreamAdapter<S> {
    /// Create a new schema-attached stream adapter.
    pub fn new(schema: SchemaRef, inner: S) -> Self {
        Self { schema, inner }
    }
}

impl<S> RecordBatchStream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Send + Unpin + 'static,
{
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl<S> Stream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Unpin,
{
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Create an empty stream (useful for stubs or early returns).
pub fn empty_stream(schema: SchemaRef) -> SendableRecordBatchStream {
    let inner = futures::stream::empty::<Result<RecordBatch>>();
    Box::pin(StreamAdapter::new(schema, inner))
}

/// Create a stream yielding the given batches in order, then end-of-stream.
pub fn batches_stream(schema: SchemaRef, batches: Vec<RecordBatch>) -> SendableRecordBatchStream {
    let inner = futures::stream::iter(batches.into_iter().map(Ok));
    Box::pin(StreamAdapter::new(schema, inner))
}

/// Hook invoked with the remaining queue depth after a consumer pop.
pub type DrainHook = Arc<dyn Fn(usize) + Send + Sync>;

struct QueueState {
    items: VecDeque<Result<RecordBatch>>,
    closed: bool,
    wakers: Vec<Waker>,
    drain_hook: Option<DrainHook>,
}

/// Producer handle for a queue-backed batch stream.
///
/// The sink node pushes from `input_received` (never blocking) and watches
/// the returned depth for its pause watermark; the consumer side pops through
/// the stream and triggers the drain hook so the sink can resume a paused
/// input. Items are yielded in push order; no relation to producer sequence
/// numbers is implied.
pub struct BatchQueue {
    state: Arc<Mutex<QueueState>>,
}

impl BatchQueue {
    /// Create a queue and the stream that drains it.
    pub fn new(schema: SchemaRef) -> (Self, SendableRecordBatchStream) {
        let state = Arc::new(Mutex::new(QueueState {
            items: VecDeque::new(),
            closed: false,
            wakers: Vec::new(),
            drain_hook: None,
        }));
        let stream = Box::pin(QueueStream {
            schema,
            state: state.clone(),
        });
        (Self { state }, stream)
    }

    /// Install the hook run after each consumer pop.
    pub fn set_drain_hook(&self, hook: DrainHook) {
        let mut state = self.state.lock().expect("batch queue lock poisoned");
        state.drain_hook = Some(hook);
    }

    /// Enqueue one item and return the queue depth after the push.
    ///
    /// Pushes after `close` are dropped (the consumer already saw
    /// end-of-stream).
    pub fn push(&self, item: Result<RecordBatch>) -> usize {
        let (depth, wakers) = {
            let mut state = self.state.lock().expect("batch queue lock poisoned");
            if state.closed {
                return state.items.len();
            }
            state.items.push_back(item);
            (state.items.len(), std::mem::take(&mut state.wakers))
        };
        for waker in wakers {
            waker.wake();
        }
        depth
    }

    /// Declare end-of-stream; queued items are still drained first.
    pub fn close(&self) {
        let wakers = {
            let mut state = self.state.lock().expect("batch queue lock poisoned");
            state.closed = true;
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("batch queue lock poisoned")
            .items
            .len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct QueueStream {
    schema: SchemaRef,
    state: Arc<Mutex<QueueState>>,
}

impl Stream for QueueStream {
    type Item = Result<RecordBatch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let (popped, hook) = {
            let mut state = self.state.lock().expect("batch queue lock poisoned");
            match state.items.pop_front() {
                Some(item) => {
                    let depth = state.items.len();
                    (Some((item, depth)), state.drain_hook.clone())
                }
                None if state.closed => return Poll::Ready(None),
                None => {
                    if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                        state.wakers.push(cx.waker().clone());
                    }
                    return Poll::Pending;
                }
            }
        };
        let (item, depth) = popped.expect("guarded above");
        if let Some(hook) = hook {
            hook(depth);
        }
        Poll::Ready(Some(item))
    }
}

impl RecordBatchStream for QueueStream {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn one_row_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))]).unwrap()
    }

    #[tokio::test]
    async fn queue_drains_in_push_order_then_ends() {
        let batch = one_row_batch();
        let (queue, mut stream) = BatchQueue::new(batch.schema());
        assert_eq!(queue.push(Ok(batch.clone())), 1);
        assert_eq!(queue.push(Ok(batch.clone())), 2);
        queue.close();
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn drain_hook_sees_remaining_depth() {
        let batch = one_row_batch();
        let (queue, mut stream) = BatchQueue::new(batch.schema());
        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        let o = observed.clone();
        queue.set_drain_hook(Arc::new(move |depth| {
            o.store(depth, Ordering::SeqCst);
        }));
        queue.push(Ok(batch.clone()));
        queue.push(Ok(batch.clone()));
        queue.close();
        let _ = stream.next().await;
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        let _ = stream.next().await;
        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn push_after_close_is_dropped() {
        let batch = one_row_batch();
        let (queue, mut stream) = BatchQueue::new(batch.schema());
        queue.close();
        queue.push(Ok(batch));
        assert!(stream.next().await.is_none());
    }
}
