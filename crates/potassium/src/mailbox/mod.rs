//! Response correlation between workers and waiting dispatcher calls.
//!
//! Workers never talk to a caller directly. They write `(key, deposit)` pairs
//! into one shared result channel ([`ResultSender`]); a single pump task
//! routes each deposit into a per-key rendezvous slot. A dispatcher call
//! claims the slot for its request id with [`Mailbox::take`] and waits there.
//!
//! Slots are created lazily by whichever side arrives first and removed once
//! the single rendezvous completes, so each id is delivered at most once.
//!
//! Streaming bodies use a companion [`MailboxKey::Stream`] key. The head is
//! deposited under the response key, then every chunk and exactly one
//! terminator ([`Deposit::End`] or [`Deposit::Error`]) under the stream key.
//! See [`stream`] for the consumer side.
//!
//! A consumer that goes away early (a cancelled `take`, or a stream dropped or
//! closed past its drain timeout) tombstones its key. Deposits that arrive
//! later for a tombstoned key are discarded, and the tombstone is cleared by
//! the key's terminal deposit, so nothing is left behind.

pub mod stream;

use crate::{
    error::{Error, Result},
    types::RequestId,
};
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;

pub use stream::ChunkStream;

/// Rendezvous key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MailboxKey {
    /// The response head for a synchronous job.
    Response(RequestId),
    /// Chunks of a streaming body for the same job.
    Stream(RequestId),
}

impl fmt::Display for MailboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(id) => write!(f, "{id}"),
            Self::Stream(id) => write!(f, "stream-{id}"),
        }
    }
}

/// Status and headers of a handler response; the body follows as chunks when
/// `streaming` is set.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub streaming: bool,
}

/// A single message deposited by a worker.
#[derive(Debug)]
pub enum Deposit {
    Head(ResponseHead),
    Chunk(Bytes),
    End,
    Error(String),
}

/// What a waiting caller receives.
#[derive(Debug)]
pub struct MailboxResponse {
    pub head: ResponseHead,
    /// Present iff `head.streaming`.
    pub stream: Option<ChunkStream>,
}

/// Producer handle onto the shared result channel.
#[derive(Clone)]
pub struct ResultSender {
    tx: mpsc::UnboundedSender<(MailboxKey, Deposit)>,
}

impl ResultSender {
    /// Deposits `deposit` under `key`. Never blocks.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelError`] if the mailbox pump has stopped.
    pub fn put(&self, key: MailboxKey, deposit: Deposit) -> Result<()> {
        self.tx
            .send((key, deposit))
            .map_err(|e| Error::ChannelError {
                context: format!("result channel closed, dropped deposit for {}", e.0.0),
            })
    }
}

struct Slot {
    tx: mpsc::UnboundedSender<Deposit>,
    rx: Option<mpsc::UnboundedReceiver<Deposit>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct Slots {
    slots: HashMap<MailboxKey, Slot>,
    abandoned: HashSet<MailboxKey>,
}

/// Per-id rendezvous map.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<Mutex<Slots>>,
    drain_timeout: Duration,
}

impl Mailbox {
    /// Creates an empty mailbox. Streams closed early are drained for at most
    /// `drain_timeout`.
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots::default())),
            drain_timeout,
        }
    }

    /// Creates a mailbox plus the shared result channel feeding it, and
    /// spawns the pump task that routes deposits into slots.
    pub fn spawn(drain_timeout: Duration) -> (Self, ResultSender) {
        let mailbox = Self::new(drain_timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(mailbox.clone(), rx));
        (mailbox, ResultSender { tx })
    }

    /// Routes a deposit into its slot, creating the slot if needed.
    pub fn put(&self, key: MailboxKey, deposit: Deposit) {
        let mut slots = self.inner.lock();

        if slots.abandoned.contains(&key) {
            tracing::trace!(%key, "discarding deposit for abandoned key");
            if finishes(&key, &deposit, &mut slots.abandoned) {
                slots.abandoned.remove(&key);
            }
            return;
        }

        let slot = slots.slots.entry(key).or_insert_with(Slot::new);
        if slot.tx.send(deposit).is_err() {
            tracing::warn!("mailbox slot has no receiver, dropping deposit");
        }
    }

    /// Waits for the response to job `id`.
    ///
    /// Blocks until the worker deposits, regardless of which side arrived
    /// first. For streaming responses the returned [`ChunkStream`] pulls the
    /// rest from the companion stream key.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelError`] if another caller already waits on `id`.
    pub async fn take(&self, id: &RequestId) -> Result<MailboxResponse> {
        let mut claim = self.claim(MailboxKey::Response(id.clone()))?;
        let deposit = claim.recv().await;
        claim.release();

        match deposit {
            Some(Deposit::Head(head)) => {
                let stream = if head.streaming {
                    let claim = self.claim(MailboxKey::Stream(id.clone()))?;
                    Some(ChunkStream::new(claim, self.drain_timeout))
                } else {
                    None
                };
                Ok(MailboxResponse { head, stream })
            }
            Some(other) => Err(Error::ChannelError {
                context: format!("expected a response head for {id}, got {other:?}"),
            }),
            None => Err(Error::ChannelError {
                context: format!("mailbox slot for {id} closed"),
            }),
        }
    }

    /// Number of live slots.
    pub fn pending(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Number of tombstoned keys still waiting for their terminal deposit.
    pub fn abandoned(&self) -> usize {
        self.inner.lock().abandoned.len()
    }

    fn claim(&self, key: MailboxKey) -> Result<Claim> {
        let mut slots = self.inner.lock();
        let slot = slots.slots.entry(key.clone()).or_insert_with(Slot::new);
        let rx = slot.rx.take().ok_or_else(|| Error::ChannelError {
            context: format!("{key} already has a consumer"),
        })?;
        Ok(Claim {
            mailbox: self.clone(),
            key,
            rx: Some(rx),
        })
    }

    fn remove(&self, key: &MailboxKey) {
        self.inner.lock().slots.remove(key);
    }

    /// Removes the slot for `key`, discarding whatever is already buffered,
    /// and tombstones the key unless its terminal deposit was among them.
    fn abandon(&self, key: MailboxKey, rx: Option<mpsc::UnboundedReceiver<Deposit>>) {
        let mut slots = self.inner.lock();
        abandon_locked(&mut slots, key, rx);
    }
}

fn abandon_locked(
    slots: &mut Slots,
    key: MailboxKey,
    rx: Option<mpsc::UnboundedReceiver<Deposit>>,
) {
    let slot = slots.slots.remove(&key);
    let mut rx = rx.or_else(|| slot.and_then(|s| s.rx));
    let mut finished = false;

    if let Some(rx) = rx.as_mut() {
        while let Ok(deposit) = rx.try_recv() {
            if let (MailboxKey::Response(id), Deposit::Head(head)) = (&key, &deposit)
                && head.streaming
            {
                abandon_locked(slots, MailboxKey::Stream(id.clone()), None);
            }
            if is_terminal(&key, &deposit) {
                finished = true;
                break;
            }
        }
    }

    if !finished {
        tracing::debug!(%key, "abandoning mailbox key");
        slots.abandoned.insert(key);
    }
}

/// Whether `deposit` is the last one `key` will ever receive.
fn is_terminal(key: &MailboxKey, deposit: &Deposit) -> bool {
    match key {
        MailboxKey::Response(_) => true,
        MailboxKey::Stream(_) => matches!(deposit, Deposit::End | Deposit::Error(_)),
    }
}

/// Like [`is_terminal`], but also propagates the tombstone to the companion
/// stream key when an abandoned response turns out to be streaming.
fn finishes(key: &MailboxKey, deposit: &Deposit, abandoned: &mut HashSet<MailboxKey>) -> bool {
    if let (MailboxKey::Response(id), Deposit::Head(head)) = (key, deposit)
        && head.streaming
    {
        abandoned.insert(MailboxKey::Stream(id.clone()));
    }
    is_terminal(key, deposit)
}

/// Exclusive consumer access to one slot. Dropping an unreleased claim
/// abandons the key.
pub(crate) struct Claim {
    mailbox: Mailbox,
    key: MailboxKey,
    rx: Option<mpsc::UnboundedReceiver<Deposit>>,
}

impl Claim {
    async fn recv(&mut self) -> Option<Deposit> {
        self.rx.as_mut()?.recv().await
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Deposit>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }

    /// Completes the rendezvous and deletes the slot.
    fn release(&mut self) {
        if self.rx.take().is_some() {
            self.mailbox.remove(&self.key);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.mailbox.abandon(self.key.clone(), Some(rx));
        }
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim").field("key", &self.key).finish()
    }
}

async fn pump(mailbox: Mailbox, mut rx: mpsc::UnboundedReceiver<(MailboxKey, Deposit)>) {
    while let Some((key, deposit)) = rx.recv().await {
        mailbox.put(key, deposit);
    }
    tracing::debug!("mailbox pump stopped");
}
