//! Single-assignment completion signal.
//!
//! Every node owns one [`CompletionFuture`] resolved exactly once when the
//! node will emit no further data; the plan owns one resolved when every node
//! future has resolved. Futures are clonable and many-reader: any number of
//! tasks can await the same completion, and listeners can be attached so the
//! plan can aggregate node completion without requiring an executor.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use brook_common::Result;

type Listener = Box<dyn FnOnce(&Result<()>) + Send>;

struct FutureState {
    result: Option<Result<()>>,
    wakers: Vec<Waker>,
    listeners: Vec<Listener>,
}

/// A clonable, observable, set-at-most-once completion signal.
///
/// Awaiting it yields the terminal `Result`; attaching a listener runs the
/// callback on the resolving thread (immediately, if already resolved).
#[derive(Clone)]
pub struct CompletionFuture {
    state: Arc<Mutex<FutureState>>,
}

impl CompletionFuture {
    /// A future in the pending state.
    pub fn pending() -> Self {
        Self {
            state: Arc::new(Mutex::new(FutureState {
                result: None,
                wakers: Vec::new(),
                listeners: Vec::new(),
            })),
        }
    }

    /// A future already resolved to `result`.
    pub fn ready(result: Result<()>) -> Self {
        let fut = Self::pending();
        fut.mark_finished(result);
        fut
    }

    /// Resolve the future. Returns `false` if it was already resolved, in
    /// which case `result` is discarded (first assignment wins).
    ///
    /// Idempotence here is what makes "stop after natural completion" a
    /// no-op for every node kind.
    pub fn mark_finished(&self, result: Result<()>) -> bool {
        let (wakers, listeners, result) = {
            let mut state = self.state.lock().expect("completion future lock poisoned");
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.listeners),
                result,
            )
        };
        for listener in listeners {
            listener(&result);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Whether the future has resolved.
    pub fn is_finished(&self) -> bool {
        self.state
            .lock()
            .expect("completion future lock poisoned")
            .result
            .is_some()
    }

    /// Non-blocking read of the terminal result, if any.
    pub fn peek(&self) -> Option<Result<()>> {
        self.state
            .lock()
            .expect("completion future lock poisoned")
            .result
            .clone()
    }

    /// Attach a completion listener.
    ///
    /// Runs on the thread that resolves the future, or immediately on the
    /// calling thread if the future is already resolved. Listeners must not
    /// block; the plan uses them for completion countdown only.
    pub fn on_complete(&self, f: impl FnOnce(&Result<()>) + Send + 'static) {
        let mut state = self.state.lock().expect("completion future lock poisoned");
        match &state.result {
            Some(result) => {
                let result = result.clone();
                drop(state);
                f(&result);
            }
            None => state.listeners.push(Box::new(f)),
        }
    }
}

impl Future for CompletionFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock().expect("completion future lock poisoned");
        if let Some(result) = &state.result {
            return Poll::Ready(result.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl std::fmt::Debug for CompletionFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.peek() {
            None => "pending",
            Some(Ok(())) => "ok",
            Some(Err(_)) => "error",
        };
        f.debug_struct("CompletionFuture")
            .field("state", &state)
            .finish()
    }
}
