use std::future::Future;

use self::{
    error::Error,
    wire::{MessageId, Tensor},
};

pub mod axon;
pub mod endpoint;
pub mod error;
pub mod wire;

pub const SYNAPSE_PORT: u16 = 547; // "SYNAPSE" in ascii, summed

/// The RPC surface a node exposes to its upstream callers. The endpoint
/// dispatches every accepted stream through this trait, so anything that
/// implements it can sit behind the wire.
pub trait NeuronService: Send + Sync + 'static {
    /// The identity this service answers as in its responses.
    fn identity(&self) -> &str;

    /// Forward pass: transform `payload` and return the result tensor.
    /// Must be idempotent per `id`.
    fn spike(
        &self,
        sender: String,
        id: MessageId,
        payload: Tensor,
    ) -> impl Future<Output = Result<Tensor, Error>> + Send;

    /// Backward pass: accept a gradient for an earlier forward result.
    /// Returns whether the gradient was accepted.
    fn grade(
        &self,
        sender: String,
        id: MessageId,
        grad: Tensor,
    ) -> impl Future<Output = Result<bool, Error>> + Send;
}
