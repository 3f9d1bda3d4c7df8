//! single assignment completion of one exchange.
//!
//! [ExecutionOutcome] is the producer side shared between the parties that can finish an exchange
//! (request executor, connection pool, the caller giving up). [OutputFuture] is the consumer side
//! awaited by caller. The first of [ExecutionOutcome::try_succeed] and [ExecutionOutcome::try_fail]
//! wins and every later attempt is a no-op.

use core::{
    future::Future,
    mem,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll, ready},
};

use std::{any::Any, io, panic, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, TimeoutError};

type FailureCallback = Box<dyn FnOnce() -> Result<(), Error> + Send>;

pub struct ExecutionOutcome<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ExecutionOutcome<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T> {
    // input slot. flipped once by the winner of completion race.
    done: AtomicBool,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    tx: Option<oneshot::Sender<Result<T, Error>>>,
    callbacks: Vec<FailureCallback>,
    // finalized by the winner of completion race while holding the lock.
    resolution: Resolution,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Pending,
    Succeeded,
    Failed,
}

impl<T> ExecutionOutcome<T> {
    /// construct a new outcome and the output future observing it.
    pub fn new() -> (Self, OutputFuture<T>) {
        let (tx, rx) = oneshot::channel();
        let outcome = Self {
            shared: Arc::new(Shared {
                done: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    tx: Some(tx),
                    callbacks: Vec::new(),
                    resolution: Resolution::Pending,
                }),
            }),
        };
        let output = OutputFuture {
            rx,
            outcome: outcome.clone(),
        };
        (outcome, output)
    }

    /// register a side effect running once after the outcome resolved to failure.
    ///
    /// callbacks run in registration order. a callback registered after failure is recorded runs
    /// immediately and one registered after success is dropped without running.
    pub fn on_failure<F>(&self, func: F)
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        match inner.resolution {
            Resolution::Pending => inner.callbacks.push(Box::new(func)),
            Resolution::Failed => {
                drop(inner);
                run_callback(Box::new(func));
            }
            Resolution::Succeeded => {}
        }
    }

    /// Returns true when either success or failure has been recorded.
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Returns false when the outcome was already resolved.
    pub fn try_succeed(&self, value: T) -> bool {
        if !self.complete() {
            trace!("execution already completed. success ignored");
            return false;
        }

        let tx = {
            let mut inner = self.shared.inner.lock();
            inner.resolution = Resolution::Succeeded;
            inner.callbacks.clear();
            inner.tx.take()
        };

        if let Some(tx) = tx {
            let _ = tx.send(Ok(value));
        }

        true
    }

    /// Returns false when the outcome was already resolved.
    pub fn try_fail(&self, cause: Error) -> bool {
        if !self.complete() {
            trace!("execution already completed. failure ignored: {cause}");
            return false;
        }

        let err = decorate(cause);

        let (tx, callbacks) = {
            let mut inner = self.shared.inner.lock();
            inner.resolution = Resolution::Failed;
            (inner.tx.take(), mem::take(&mut inner.callbacks))
        };

        if let Some(tx) = tx {
            let _ = tx.send(Err(err));
        }

        callbacks.into_iter().for_each(run_callback);

        true
    }

    fn complete(&self) -> bool {
        self.shared
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn run_callback(func: FailureCallback) {
    match panic::catch_unwind(panic::AssertUnwindSafe(func)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failure callback of execution returned error: {e}"),
        Err(payload) => warn!("failure callback of execution panicked: {}", panic_message(&*payload)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// translate raw transport and timer errors into stable error kinds.
pub(crate) fn decorate(err: Error) -> Error {
    match err {
        Error::Timeout(TimeoutError::Acquire) => Error::ConnectionAcquireTimeout,
        Error::QueueFull(size) => Error::AcquireQueueOverflow(size),
        Error::Timeout(TimeoutError::Read) => Error::ReadTimeout,
        Error::Timeout(TimeoutError::Write) => Error::WriteTimeout,
        Error::Io(e) if is_closed_kind(e.kind()) => {
            debug!("transport closed before exchange completed: {e}");
            Error::PrematureChannelClose
        }
        err => err,
    }
}

fn is_closed_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// caller facing side of [ExecutionOutcome].
///
/// dropping it before resolution fails the outcome with [Error::Cancelled], which in turn runs the
/// registered failure callbacks.
pub struct OutputFuture<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
    outcome: ExecutionOutcome<T>,
}

impl<T> Future for OutputFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let res = ready!(Pin::new(&mut self.get_mut().rx).poll(cx));
        Poll::Ready(res.unwrap_or(Err(Error::Cancelled)))
    }
}

impl<T> Drop for OutputFuture<T> {
    fn drop(&mut self) {
        if !self.outcome.is_done() {
            self.outcome.try_fail(Error::Cancelled);
        }
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::AtomicUsize;

    use std::thread;

    use super::*;

    #[tokio::test]
    async fn first_completion_wins() {
        let (outcome, output) = ExecutionOutcome::<u32>::new();
        assert!(outcome.try_fail(Error::PoolClosed));
        assert!(!outcome.try_succeed(996));
        assert!(!outcome.try_fail(Error::Cancelled));
        assert!(matches!(output.await, Err(Error::PoolClosed)));

        let (outcome, output) = ExecutionOutcome::<u32>::new();
        assert!(outcome.try_succeed(996));
        assert!(!outcome.try_fail(Error::PoolClosed));
        assert_eq!(output.await.unwrap(), 996);
    }

    #[tokio::test]
    async fn decorate_raw_error() {
        let (outcome, output) = ExecutionOutcome::<()>::new();
        outcome.try_fail(Error::Timeout(TimeoutError::Acquire));
        assert!(matches!(output.await, Err(Error::ConnectionAcquireTimeout)));

        let (outcome, output) = ExecutionOutcome::<()>::new();
        outcome.try_fail(Error::QueueFull(8));
        assert!(matches!(output.await, Err(Error::AcquireQueueOverflow(8))));

        let (outcome, output) = ExecutionOutcome::<()>::new();
        outcome.try_fail(Error::Timeout(TimeoutError::Read));
        assert!(matches!(output.await, Err(Error::ReadTimeout)));

        let (outcome, output) = ExecutionOutcome::<()>::new();
        outcome.try_fail(Error::Timeout(TimeoutError::Write));
        assert!(matches!(output.await, Err(Error::WriteTimeout)));

        let (outcome, output) = ExecutionOutcome::<()>::new();
        outcome.try_fail(io::Error::from(io::ErrorKind::ConnectionReset).into());
        assert!(matches!(output.await, Err(Error::PrematureChannelClose)));

        let (outcome, output) = ExecutionOutcome::<()>::new();
        outcome.try_fail(io::Error::from(io::ErrorKind::PermissionDenied).into());
        match output.await {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            res => panic!("unexpected output: {res:?}"),
        }
    }

    #[test]
    fn failure_callback_runs_once() {
        let (outcome, _output) = ExecutionOutcome::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        outcome.on_failure(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let handles = (0..8)
            .map(|_| {
                let outcome = outcome.clone();
                thread::spawn(move || outcome.try_fail(Error::Cancelled))
            })
            .collect::<Vec<_>>();

        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|win| *win)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn misbehaving_callback_does_not_block_others() {
        let (outcome, _output) = ExecutionOutcome::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        outcome.on_failure(|| panic!("callback panic"));
        outcome.on_failure(|| Err(Error::PoolClosed));
        let c = count.clone();
        outcome.on_failure(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        outcome.try_fail(Error::Cancelled);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // registration after failure runs right away.
        let c = count.clone();
        outcome.on_failure(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn success_drops_callbacks() {
        let (outcome, _output) = ExecutionOutcome::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        outcome.on_failure(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        outcome.try_succeed(());
        outcome.try_fail(Error::Cancelled);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_output_cancels() {
        let (outcome, output) = ExecutionOutcome::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        outcome.on_failure(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        drop(output);
        assert!(outcome.is_done());
        assert!(!outcome.try_succeed(()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
