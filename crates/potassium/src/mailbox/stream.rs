//! Consumer side of a streaming response.
//!
//! A [`ChunkStream`] yields body chunks as the worker deposits them. It owns
//! the claim on the stream key, so the slot is removed exactly when the
//! terminator is observed. If the consumer stops early the remaining chunks
//! still have to be pulled off the slot: [`ChunkStream::close`] does this in
//! place, and dropping the stream spawns the same drain in the background.
//! Either way the drain is bounded by the mailbox's drain timeout, after which
//! the key is tombstoned.

use super::{Claim, Deposit};
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};

/// Lazily consumed body of a streaming response.
#[derive(Debug)]
pub struct ChunkStream {
    claim: Option<Claim>,
    drain_timeout: Duration,
}

impl ChunkStream {
    pub(crate) fn new(claim: Claim, drain_timeout: Duration) -> Self {
        Self {
            claim: Some(claim),
            drain_timeout,
        }
    }

    /// Whether the terminator has already been observed.
    pub fn is_finished(&self) -> bool {
        self.claim.is_none()
    }

    /// Stops consuming and drains whatever the worker still produces.
    ///
    /// # Errors
    ///
    /// [`Error::StreamCarried`] if the stream terminates with an error while
    /// being drained.
    pub async fn close(mut self) -> Result<()> {
        match self.claim.take() {
            Some(claim) => drain(claim, self.drain_timeout).await,
            None => Ok(()),
        }
    }

    fn finish(&mut self) {
        if let Some(mut claim) = self.claim.take() {
            claim.release();
        }
    }
}

impl Stream for ChunkStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(claim) = this.claim.as_mut() else {
            return Poll::Ready(None);
        };

        let item = match ready!(claim.poll_recv(cx)) {
            Some(Deposit::Chunk(chunk)) => return Poll::Ready(Some(Ok(chunk))),
            Some(Deposit::End) | None => None,
            Some(Deposit::Error(message)) => Some(Err(Error::StreamCarried { message })),
            Some(Deposit::Head(_)) => Some(Err(Error::ChannelError {
                context: "response head deposited on a stream key".into(),
            })),
        };
        this.finish();
        Poll::Ready(item)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        let limit = self.drain_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = drain(claim, limit).await {
                        tracing::warn!(error = %e, "stream dropped early and failed while draining");
                    }
                });
            }
            // No runtime to drain on; tombstone the key right away.
            Err(_) => drop(claim),
        }
    }
}

async fn drain(mut claim: Claim, limit: Duration) -> Result<()> {
    let drained = tokio::time::timeout(limit, async {
        let mut discarded = 0_usize;
        loop {
            match claim.recv().await {
                Some(Deposit::Chunk(_)) => discarded += 1,
                Some(Deposit::End) | None => break Ok(discarded),
                Some(Deposit::Error(message)) => break Err(Error::StreamCarried { message }),
                Some(Deposit::Head(_)) => {
                    break Err(Error::ChannelError {
                        context: "response head deposited on a stream key".into(),
                    });
                }
            }
        }
    })
    .await;

    match drained {
        Ok(result) => {
            claim.release();
            let discarded = result?;
            tracing::debug!(discarded, "drained unread stream chunks");
            Ok(())
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = limit.as_millis() as u64,
                "stream drain timed out, abandoning remaining chunks"
            );
            drop(claim);
            Ok(())
        }
    }
}
