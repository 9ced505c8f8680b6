//! Joining the primary and mask retrievals of a masked tile.
//!
//! Each half is delivered through a oneshot channel wired into a retrieval
//! completion callback. Once the first half arrives the join waits at most
//! `hold_timeout` for the other; a failed half ends the join with that half's
//! error.

use crate::error::{TileError, TransportError};
use crate::retrieval::{CompletionCallback, RetrievalOutcome, RetrievalResult};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Sending side of one half of a join.
#[derive(Debug)]
pub struct JoinHalf(oneshot::Sender<RetrievalResult>);

impl JoinHalf {
    /// Wraps the half as a retrieval completion callback.
    pub fn into_callback(self) -> CompletionCallback {
        Box::new(move |result: &RetrievalResult| {
            let _ = self.0.send(result.clone());
        })
    }
}

/// Receiving side awaiting both halves.
#[derive(Debug)]
pub struct MaskJoin {
    primary: oneshot::Receiver<RetrievalResult>,
    mask: oneshot::Receiver<RetrievalResult>,
    label: String,
}

/// Creates the primary half, the mask half and the join awaiting both.
///
/// `label` identifies the tile in errors and logs.
pub fn join_pair(label: impl Into<String>) -> (JoinHalf, JoinHalf, MaskJoin) {
    let (primary_tx, primary_rx) = oneshot::channel();
    let (mask_tx, mask_rx) = oneshot::channel();
    (
        JoinHalf(primary_tx),
        JoinHalf(mask_tx),
        MaskJoin {
            primary: primary_rx,
            mask: mask_rx,
            label: label.into(),
        },
    )
}

enum First {
    Primary(Result<RetrievalResult, oneshot::error::RecvError>),
    Mask(Result<RetrievalResult, oneshot::error::RecvError>),
}

impl MaskJoin {
    /// Waits for both halves and returns `(primary, mask)`.
    ///
    /// Both returned results are successful (`Fetched` or `NotModified`).
    pub async fn wait(self, hold_timeout: Duration) -> Result<(RetrievalResult, RetrievalResult), TileError> {
        let MaskJoin {
            mut primary,
            mut mask,
            label,
        } = self;

        let first = tokio::select! {
            r = &mut primary => First::Primary(r),
            r = &mut mask => First::Mask(r),
        };

        let timed_out = || {
            debug!(tile = %label, timeout_ms = hold_timeout.as_millis() as u64, "Mask join timed out");
            TileError::Transport(TransportError::Timeout(format!("mask join for {}", label)))
        };

        match first {
            First::Primary(r) => {
                let primary = successful(r)?;
                let mask = tokio::time::timeout(hold_timeout, mask)
                    .await
                    .map_err(|_| timed_out())?;
                Ok((primary, successful(mask)?))
            }
            First::Mask(r) => {
                let mask = successful(r)?;
                let primary = tokio::time::timeout(hold_timeout, primary)
                    .await
                    .map_err(|_| timed_out())?;
                Ok((successful(primary)?, mask))
            }
        }
    }
}

fn successful(
    received: Result<RetrievalResult, oneshot::error::RecvError>,
) -> Result<RetrievalResult, TileError> {
    let result = received.map_err(|_| TileError::Cancelled)?;
    match &result.outcome {
        RetrievalOutcome::Fetched(_) | RetrievalOutcome::NotModified => Ok(result),
        RetrievalOutcome::Failed(e) => Err(TileError::Transport(e.clone())),
        RetrievalOutcome::Cancelled => Err(TileError::Cancelled),
    }
}
