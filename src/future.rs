//! A minimal promise/future abstraction (Design Notes §9: "adopt a
//! minimal promise/future abstraction with `then`, `any_of`, `all_of`,
//! `with_timeout`, `run_on(pool)`"), used everywhere spec.md says a
//! component "returns a future": [`PriorityTask`](crate::task::PriorityTask)
//! handles, switch-out results, and the hybrid processor's per-request
//! result.
//!
//! `Deferred<T>` is driven by whichever thread calls [`Completer::complete`]
//! — there is no background executor polling it. A worker thread can
//! therefore register a continuation and move on to its next task (the
//! switch-out protocol's whole point) instead of blocking, while a
//! synchronous caller can still [`Deferred::wait`] when blocking is what
//! it wants.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

type Callback<T> = Box<dyn FnOnce(Result<T, Error>) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Ready(Result<T, Error>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// The write side of a [`Deferred`]. Consumed by [`Completer::complete`],
/// enforcing "written exactly once" at the type level.
pub struct Completer<T> {
    inner: Arc<Inner<T>>,
}

/// The read side: cheaply cloneable, many holders may `wait` or register
/// `on_complete` callbacks against the same completion.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            inner: self.inner.clone(),
        }
    }
}

/// Creates a linked `(Completer, Deferred)` pair, analogous to a oneshot
/// channel's `(Sender, Receiver)`.
pub fn pending<T>() -> (Completer<T>, Deferred<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Pending(Vec::new())),
        cond: Condvar::new(),
    });
    (
        Completer {
            inner: inner.clone(),
        },
        Deferred { inner },
    )
}

impl<T> Completer<T>
where
    T: Clone + Send + 'static,
{
    /// Publishes the result, running every registered callback on this
    /// thread. Idempotent in the sense that a second `complete` (e.g. a
    /// timeout racing a normal completion) is simply a programming error
    /// guarded against by call sites that own exclusive completers
    /// (the type is consumed by value, so double-complete can't compile).
    pub fn complete(self, result: Result<T, Error>) {
        let callbacks = {
            let mut state = self.inner.state.lock().unwrap();
            match std::mem::replace(&mut *state, State::Ready(result.clone())) {
                State::Pending(cbs) => cbs,
                State::Ready(_) => Vec::new(),
            }
        };
        self.inner.cond.notify_all();
        for cb in callbacks {
            cb(result.clone());
        }
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + 'static,
{
    /// A `Deferred` that is already resolved — used by the synchronous
    /// dispatch path, which never needs to park a real completion.
    pub fn ready(value: Result<T, Error>) -> Self {
        let (completer, deferred) = pending();
        completer.complete(value);
        deferred
    }

    /// Registers `f` to run when the result is available. If already
    /// available, `f` runs immediately on the calling thread.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            State::Pending(cbs) => cbs.push(Box::new(f)),
            State::Ready(result) => {
                let result = result.clone();
                drop(state);
                f(result);
            }
        }
    }

    /// Blocks the calling thread until the result is ready. Safe to call
    /// from a pool worker — blocking a worker on a deferred result it
    /// itself produced synchronously (e.g. the SYNC dispatch path) is
    /// exactly what the design intends; it is switch-outs that must
    /// avoid this by not calling `wait` at all.
    pub fn wait(&self) -> Result<T, Error> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match &*state {
                State::Ready(result) => return result.clone(),
                State::Pending(_) => {
                    state = self.inner.cond.wait(state).unwrap();
                }
            }
        }
    }

    /// Blocks up to `timeout`; returns `Error::RequestTimeout` if the
    /// deadline passes first. Used by the hybrid processor's SYNC path
    /// (§4.4: "wait up to 30s; on exceeding, complete with
    /// REQUEST_TIMEOUT").
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match &*state {
                State::Ready(result) => return result.clone(),
                State::Pending(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::RequestTimeout);
                    }
                    let (guard, timed_out) =
                        self.inner.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                    if timed_out.timed_out() {
                        if let State::Ready(result) = &*state {
                            return result.clone();
                        }
                        return Err(Error::RequestTimeout);
                    }
                }
            }
        }
    }

    /// Returns a new `Deferred<U>` that resolves when `self` does, with
    /// `f` applied to a successful value. Errors pass through unchanged.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (completer, out) = pending();
        self.on_complete(move |result| {
            completer.complete(result.map(f));
        });
        out
    }

    /// First of `branches` to complete wins; the rest are left to resolve
    /// on their own (their results are simply never observed through the
    /// returned `Deferred`) — used to race a deferred operation against a
    /// timer in [`crate::switching`].
    pub fn any_of(branches: Vec<Deferred<T>>) -> Deferred<T> {
        let (completer, out) = pending();
        let completer = Arc::new(Mutex::new(Some(completer)));
        for branch in branches {
            let completer = completer.clone();
            branch.on_complete(move |result| {
                if let Some(completer) = completer.lock().unwrap().take() {
                    completer.complete(result);
                }
            });
        }
        out
    }

    /// Waits for every branch, preserving order, collecting each
    /// branch's `Result` rather than short-circuiting — used by
    /// `execute_multiple` (§4.3), where one branch's failure must not
    /// hide the others' successes.
    pub fn all_of(branches: Vec<Deferred<T>>) -> Deferred<Vec<Result<T, Error>>> {
        let (completer, out) = pending();
        let total = branches.len();
        if total == 0 {
            completer.complete(Ok(Vec::new()));
            return out;
        }
        let results: Arc<Mutex<Vec<Option<Result<T, Error>>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(total));
        let completer = Arc::new(Mutex::new(Some(completer)));
        for (idx, branch) in branches.into_iter().enumerate() {
            let results = results.clone();
            let remaining = remaining.clone();
            let completer = completer.clone();
            branch.on_complete(move |result| {
                results.lock().unwrap()[idx] = Some(result);
                if remaining.fetch_sub(1, std::sync::atomic::Ordering::AcqRel) == 1 {
                    let collected = results
                        .lock()
                        .unwrap()
                        .drain(..)
                        .map(|slot| slot.expect("every slot filled when remaining hits 0"))
                        .collect();
                    if let Some(completer) = completer.lock().unwrap().take() {
                        completer.complete(Ok(collected));
                    }
                }
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_blocks_until_completed() {
        let (completer, deferred) = pending::<i32>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(42));
        });
        assert_eq!(deferred.wait().unwrap(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let (_completer, deferred) = pending::<i32>();
        let result = deferred.wait_timeout(Duration::from_millis(10));
        assert!(matches!(result, Err(Error::RequestTimeout)));
    }

    #[test]
    fn on_complete_after_ready_runs_immediately() {
        let deferred = Deferred::ready(Ok::<_, Error>(7));
        let (tx, rx) = std::sync::mpsc::channel();
        deferred.on_complete(move |result| {
            tx.send(result).unwrap();
        });
        assert_eq!(rx.recv().unwrap().unwrap(), 7);
    }

    #[test]
    fn any_of_resolves_with_first_completion() {
        let (c1, d1) = pending::<i32>();
        let (c2, d2) = pending::<i32>();
        let raced = Deferred::any_of(vec![d1, d2]);
        c2.complete(Ok(2));
        c1.complete(Ok(1));
        assert_eq!(raced.wait().unwrap(), 2);
    }

    #[test]
    fn all_of_preserves_order() {
        let (c0, d0) = pending::<i32>();
        let (c1, d1) = pending::<i32>();
        let (c2, d2) = pending::<i32>();
        let joined = Deferred::all_of(vec![d0, d1, d2]);
        c2.complete(Ok(20));
        c0.complete(Ok(0));
        c1.complete(Ok(10));
        let results = joined.wait().unwrap();
        assert_eq!(
            results.into_iter().map(|r| r.unwrap()).collect::<Vec<_>>(),
            vec![0, 10, 20]
        );
    }
}
