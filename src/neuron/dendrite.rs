use std::time::Duration;

use futures::future::join_all;
use tokio::{sync::RwLock, time::timeout};
use tracing::{debug, warn};

use super::net::{
    axon::Axon,
    error::Error,
    wire::{MessageId, Tensor},
};

/// Outcome of one downstream call, per slot.
#[derive(Debug)]
pub enum PeerReply {
    Success(Tensor),
    /// No axon in the slot, or the call failed outright.
    Unreachable,
    /// The peer did not answer within the per-peer timeout.
    TimedOut,
    /// The peer answered with something that did not parse or had the
    /// wrong shape.
    Malformed,
}

/// The fan-out side of a node: a fixed number of positionally ordered
/// downstream slots. Slot order is part of the protocol, the nucleus pairs
/// gradients with responses by position.
pub struct Dendrite {
    identity: String,
    slots: RwLock<Vec<Option<Axon>>>,
    peer_timeout: Duration,
    feature_dim: u32,
}

impl Dendrite {
    pub fn new(
        identity: String,
        k: usize,
        peer_timeout: Duration,
        feature_dim: u32,
    ) -> Self {
        Self {
            identity,
            slots: RwLock::new(vec![None; k]),
            peer_timeout,
            feature_dim,
        }
    }

    pub async fn attach(&self, slot: usize, axon: Axon) {
        let mut slots = self.slots.write().await;
        if slot < slots.len() {
            debug!(slot, remote = %axon.remote_addr(), "attaching peer");
            slots[slot] = Some(axon);
        } else {
            warn!(slot, "attach out of range, ignoring");
        }
    }

    pub async fn detach(&self, slot: usize) {
        let mut slots = self.slots.write().await;
        if slot < slots.len() {
            slots[slot] = None;
        }
    }

    /// Issues the forward RPC to every slot concurrently, each bounded by
    /// the per-peer timeout. Always returns exactly k tensors in slot
    /// order; any slot that did not produce a usable response contributes
    /// zeros of the expected shape.
    pub async fn spike(&self, id: MessageId, uspikes: &Tensor) -> Vec<Tensor> {
        let slots: Vec<Option<Axon>> = self.slots.read().await.clone();
        let calls = slots.iter().map(|slot| async move {
            match slot {
                None => PeerReply::Unreachable,
                Some(axon) => {
                    let call = axon.spike(
                        self.identity.clone(),
                        id,
                        uspikes.clone(),
                    );
                    match timeout(self.peer_timeout, call).await {
                        Err(_) => PeerReply::TimedOut,
                        Ok(Err(
                            Error::CouldNotDecodeMessage
                            | Error::MalformedTensor
                            | Error::MessageLengthOverflowed
                            | Error::UnexpectedResponse,
                        )) => PeerReply::Malformed,
                        Ok(Err(e)) => {
                            debug!(remote = %axon.remote_addr(), error = ?e, "spike failed");
                            PeerReply::Unreachable
                        }
                        Ok(Ok((_responder, payload))) => {
                            if payload.rows == uspikes.rows
                                && payload.cols == self.feature_dim
                                && payload.well_formed()
                            {
                                PeerReply::Success(payload)
                            } else {
                                PeerReply::Malformed
                            }
                        }
                    }
                }
            }
        });
        join_all(calls)
            .await
            .into_iter()
            .enumerate()
            .map(|(slot, reply)| match reply {
                PeerReply::Success(payload) => payload,
                other => {
                    debug!(slot, reply = ?other, "zero-filling slot");
                    Tensor::zeros(uspikes.rows, self.feature_dim)
                }
            })
            .collect()
    }

    /// Issues the backward RPC to every live slot concurrently,
    /// fire-and-forget: every failure is logged and swallowed, nothing is
    /// retried.
    pub async fn grade(&self, id: MessageId, dgrades: Vec<Tensor>) {
        let slots: Vec<Option<Axon>> = self.slots.read().await.clone();
        if dgrades.len() != slots.len() {
            warn!(
                expected = slots.len(),
                got = dgrades.len(),
                "gradient count does not match slot count, skipping fan-out"
            );
            return;
        }
        let calls =
            slots.iter().zip(dgrades).enumerate().map(|(slot, (peer, grad))| async move {
                let Some(axon) = peer else { return };
                let call = axon.grade(self.identity.clone(), id, grad);
                match timeout(self.peer_timeout, call).await {
                    Err(_) => debug!(slot, "grade timed out"),
                    Ok(Err(e)) => debug!(slot, error = ?e, "grade failed"),
                    Ok(Ok(false)) => debug!(slot, "grade not accepted"),
                    Ok(Ok(true)) => {}
                }
            });
        join_all(calls).await;
    }
}
