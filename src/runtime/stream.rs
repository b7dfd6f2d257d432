//! In-order execution stream.
//!
//! Work is enqueued as boxed jobs and executed in issue order on a dedicated
//! worker thread. `launch` returns as soon as the job is queued; completion (and
//! any fault) is only observed through [`Stream::synchronize`].

use crate::error::{Error, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Message {
    Launch {
        name: &'static str,
        time_kernel: bool,
        job: Job,
    },
    Barrier(Sender<()>),
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(0);

/// A handle to an execution stream. Clones share the same queue.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: u64,
    sender: Mutex<Option<Sender<Message>>>,
    fault: Arc<Mutex<Option<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Launch-time options, passed along with a kernel argument.
#[derive(Clone, Copy)]
pub struct StreamConfig<'a> {
    pub stream: &'a Stream,
    /// Log the wall time of each launched job.
    pub time_kernel: bool,
}

impl<'a> StreamConfig<'a> {
    pub fn new(stream: &'a Stream) -> Self {
        Self {
            stream,
            time_kernel: false,
        }
    }
}

impl Stream {
    pub fn new() -> Self {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel();
        let fault = Arc::new(Mutex::new(None));
        let worker_fault = Arc::clone(&fault);
        let worker = thread::Builder::new()
            .name(format!("fmha-stream-{id}"))
            .spawn(move || run_worker(id, receiver, worker_fault))
            .ok();
        if worker.is_none() {
            record_fault(&fault, "failed to spawn stream worker".to_string());
        }
        Self {
            inner: Arc::new(StreamInner {
                id,
                sender: Mutex::new(Some(sender)),
                fault,
                worker: Mutex::new(worker),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Enqueue `job`. Returns once queued, not once executed.
    pub fn launch<F>(&self, name: &'static str, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.send(Message::Launch {
            name,
            time_kernel: false,
            job: Box::new(job),
        })
    }

    pub(crate) fn launch_with<F>(
        &self,
        config: &StreamConfig<'_>,
        name: &'static str,
        job: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.send(Message::Launch {
            name,
            time_kernel: config.time_kernel,
            job: Box::new(job),
        })
    }

    fn send(&self, msg: Message) -> Result<()> {
        let guard = self.inner.sender.lock().map_err(|_| Error::DeviceFault {
            reason: "stream queue poisoned".into(),
        })?;
        let sender = guard.as_ref().ok_or_else(|| Error::DeviceFault {
            reason: "stream has been shut down".into(),
        })?;
        sender.send(msg).map_err(|_| Error::DeviceFault {
            reason: format!("stream {} worker is gone", self.inner.id),
        })
    }

    /// Block until every job issued so far has run. A fault recorded by any job is
    /// sticky: it is returned here and by every later call.
    pub fn synchronize(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.send(Message::Barrier(tx))?;
        rx.recv().map_err(|_| Error::DeviceFault {
            reason: format!("stream {} worker exited before barrier", self.inner.id),
        })?;
        self.check_fault()
    }

    /// Report a recorded fault without waiting.
    pub fn check_fault(&self) -> Result<()> {
        let fault = self.inner.fault.lock().map_err(|_| Error::DeviceFault {
            reason: "fault slot poisoned".into(),
        })?;
        match fault.as_ref() {
            Some(reason) => Err(Error::DeviceFault {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stream({})", self.inner.id)
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

fn record_fault(slot: &Mutex<Option<String>>, reason: String) {
    if let Ok(mut fault) = slot.lock() {
        if fault.is_none() {
            *fault = Some(reason);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".to_string()
    }
}

fn run_worker(id: u64, receiver: Receiver<Message>, fault: Arc<Mutex<Option<String>>>) {
    for msg in receiver {
        match msg {
            Message::Launch {
                name,
                time_kernel,
                job,
            } => {
                let faulted = fault.lock().map(|f| f.is_some()).unwrap_or(true);
                if faulted {
                    tracing::trace!(stream = id, job = name, "skipping job on faulted stream");
                    continue;
                }
                tracing::trace!(stream = id, job = name, "running job");
                let start = Instant::now();
                let outcome = panic::catch_unwind(AssertUnwindSafe(job));
                if time_kernel {
                    tracing::debug!(
                        stream = id,
                        job = name,
                        elapsed_ms = start.elapsed().as_secs_f64() * 1e3,
                        "job finished"
                    );
                }
                let reason = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{name}: {e}")),
                    Err(payload) => Some(format!("{name}: {}", panic_message(payload.as_ref()))),
                };
                if let Some(reason) = reason {
                    tracing::error!(stream = id, job = name, %reason, "job faulted");
                    record_fault(&fault, reason);
                }
            }
            Message::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}
