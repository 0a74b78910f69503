use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Mutex,
    thread::{Builder as ThreadBuilder, JoinHandle},
};

use tokio::sync::mpsc::{self, UnboundedSender};

use crate::{logging::panic_message, lock};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs one after another, in submission order, on a thread of its own.
///
/// Menu callbacks are user code, they get to block and they get to call back into the tray, so
/// they never run on a thread that belongs to a backend.
pub(crate) struct CallbackExecutor {
    tx: Mutex<Option<UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackExecutor {
    pub(crate) const THREAD_NAME: &'static str = "systray executor";

    pub fn spawn() -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        // This thread never enters a tokio runtime, callbacks are free to block on one
        let thread = ThreadBuilder::new()
            .name(Self::THREAD_NAME.into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        tracing::error!(
                            "A job on the {} thread panicked: '{}'",
                            Self::THREAD_NAME,
                            panic_message(payload.as_ref())
                        );
                    }
                }

                tracing::debug!("{} has shut down", Self::THREAD_NAME);
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues `job`. Returns `false`, dropping the job, if the executor was shut down.
    pub fn execute(&self, job: Job) -> bool {
        let tx = lock(&self.tx);
        let Some(tx) = tx.as_ref() else {
            tracing::warn!("Rejecting job, the callback executor was shut down");
            return false;
        };

        if tx.send(job).is_err() {
            tracing::warn!("Rejecting job, the callback executor thread is gone");
            return false;
        }

        true
    }

    /// Stops accepting jobs. Jobs that are already queued still run.
    ///
    /// This does not wait for the queue to drain, it may be called from a job.
    pub fn shutdown(&self) {
        lock(&self.tx).take();
    }

    #[cfg(test)]
    pub fn is_shut_down(&self) -> bool {
        lock(&self.tx).is_none()
    }

    /// Shuts down and waits for the queued jobs to finish. Does nothing when called from a job.
    #[cfg(test)]
    pub fn shutdown_and_wait(&self) {
        self.shutdown();

        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!("{} panicked outside of a job", Self::THREAD_NAME);
        }
    }
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        self.shutdown();
        // Detach, the thread exits by itself once the queue is drained
        drop(lock(&self.thread).take());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc, Mutex},
        thread,
    };

    use super::*;

    #[test]
    fn runs_jobs_in_order_on_named_thread() {
        let executor = CallbackExecutor::spawn().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            assert!(executor.execute(Box::new(move || {
                let name = thread::current().name().map(ToOwned::to_owned);
                seen.lock().unwrap().push((i, name));
            })));
        }
        executor.shutdown_and_wait();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        for (expected, (i, name)) in seen.iter().enumerate() {
            assert_eq!(*i, expected);
            assert_eq!(name.as_deref(), Some(CallbackExecutor::THREAD_NAME));
        }
    }

    #[test]
    fn rejects_after_shutdown() {
        let executor = CallbackExecutor::spawn().unwrap();
        executor.shutdown();

        assert!(executor.is_shut_down());
        assert!(!executor.execute(Box::new(|| panic!("must not run"))));
    }

    #[test]
    fn survives_panicking_jobs() {
        let executor = CallbackExecutor::spawn().unwrap();
        let (tx, rx) = mpsc::channel();

        executor.execute(Box::new(|| panic!("callback blew up")));
        executor.execute(Box::new(move || tx.send("still alive").unwrap()));

        assert_eq!(rx.recv().unwrap(), "still alive");
    }

    #[test]
    fn queued_jobs_run_after_shutdown() {
        let executor = CallbackExecutor::spawn().unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        executor.execute(Box::new(move || gate_rx.recv().unwrap()));
        executor.execute(Box::new(move || done_tx.send(()).unwrap()));
        executor.shutdown();
        gate_tx.send(()).unwrap();

        assert!(done_rx.recv().is_ok());
    }
}
