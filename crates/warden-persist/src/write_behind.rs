//! Write-behind queue: applies committed changes to storage on a worker
//! thread, in submission order, retrying failures with backoff.
//!
//! In-memory claim state stays authoritative while storage is degraded. An
//! op whose attempts are exhausted is logged at `error` level and handed to
//! the dead-letter channel; later ops keep flowing.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use warden_claims::{PersistOp, PersistenceGateway, PersistenceSink};

use crate::backoff::RetryPolicy;

/// An op that could not be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// The op given up on.
    pub op: PersistOp,
    /// Error of the last attempt.
    pub error: String,
    /// Attempts made.
    pub attempts: u32,
}

enum Command {
    Apply(PersistOp),
    Flush(Sender<()>),
}

/// Queue in front of a [`PersistenceGateway`]. Implements
/// [`PersistenceSink`], so it can be handed to the claim engine directly.
pub struct WriteBehindQueue {
    sender: Option<Sender<Command>>,
    dead_letters: Receiver<DeadLetter>,
    pending: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl WriteBehindQueue {
    /// Starts the worker thread.
    pub fn new(gateway: Arc<dyn PersistenceGateway>, policy: RetryPolicy) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Command>();
        let (dead_sender, dead_letters) = unbounded::<DeadLetter>();
        let pending = Arc::new(AtomicU64::new(0));

        let worker_pending = Arc::clone(&pending);
        let worker = std::thread::Builder::new()
            .name("persist-writer".into())
            .spawn(move || {
                while let Ok(command) = receiver.recv() {
                    match command {
                        Command::Apply(op) => {
                            if let Some(dead) = apply_with_retry(gateway.as_ref(), &policy, op) {
                                let _ = dead_sender.send(dead);
                            }
                            worker_pending.fetch_sub(1, Ordering::SeqCst);
                        }
                        Command::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                tracing::debug!("Persistence writer stopped");
            })?;

        Ok(Self {
            sender: Some(sender),
            dead_letters,
            pending,
            worker: Some(worker),
        })
    }

    /// Ops submitted but not yet stored or given up on.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Ops given up on, oldest first.
    pub fn dead_letters(&self) -> &Receiver<DeadLetter> {
        &self.dead_letters
    }

    /// Waits until everything submitted before this call has been handled.
    /// Returns `false` on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(sender) = &self.sender else {
            return true;
        };
        let (ack, done) = bounded(1);
        if sender.send(Command::Flush(ack)).is_err() {
            return false;
        }
        done.recv_timeout(timeout).is_ok()
    }
}

impl PersistenceSink for WriteBehindQueue {
    fn submit(&self, op: PersistOp) {
        let Some(sender) = &self.sender else {
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = sender.send(Command::Apply(op)) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let Command::Apply(op) = e.into_inner() else {
                return;
            };
            tracing::error!(op = %op.describe(), "Persistence writer is gone; dropping op");
        }
    }
}

impl Drop for WriteBehindQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("Persistence writer panicked");
        }
    }
}

fn apply_with_retry(
    gateway: &dyn PersistenceGateway,
    policy: &RetryPolicy,
    op: PersistOp,
) -> Option<DeadLetter> {
    let mut backoff = policy.backoff();
    loop {
        let error = match gateway.apply(&op) {
            Ok(()) => {
                if backoff.failures() > 0 {
                    tracing::info!(op = %op.describe(), failures = backoff.failures(), "Stored after retrying");
                }
                return None;
            }
            Err(e) => e,
        };

        match backoff.next_delay() {
            Some(delay) => {
                tracing::warn!(
                    op = %op.describe(),
                    attempt = backoff.failures(),
                    ?delay,
                    %error,
                    "Storage write failed; retrying"
                );
                std::thread::sleep(delay);
            }
            None => {
                tracing::error!(
                    op = %op.describe(),
                    attempts = backoff.failures(),
                    %error,
                    "Storage write failed; giving up"
                );
                return Some(DeadLetter {
                    error: error.to_string(),
                    attempts: backoff.failures(),
                    op,
                });
            }
        }
    }
}
