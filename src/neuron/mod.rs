use std::{future::Future, net::SocketAddr, sync::Arc};

use tracing::{debug, debug_span, info, Instrument};

use self::{
    config::NeuronConfig,
    dendrite::Dendrite,
    memory::{Buffer, Memory, SweepStats},
    net::{
        endpoint::{Endpoint, TlsIdentity},
        error::Error,
        wire::{MessageId, Tensor},
        NeuronService,
    },
    nucleus::Nucleus,
};

pub mod config;
pub mod dendrite;
pub mod hex;
pub mod memory;
pub mod net;
pub mod nucleus;

// A neuron sits between one upstream caller and k downstream peers. The
// forward pass fans the caller's activation out, folds the k responses
// through the nucleus and caches everything it saw under the pass's message
// id. The backward pass looks that state up again, splits the incoming
// gradient across the same k slots and parks the local share until the
// learn sweep applies it. All coordination state lives in the cache keyed
// by message id, so the same id arriving twice (duplicate delivery, or a
// cycle in the peer graph) is served from the first pass instead of
// recursing again.

/// One mesh node: RPC service, fan-out, cache and local transform under a
/// single identity.
pub struct Neuron<N: Nucleus> {
    config: NeuronConfig,
    endpoint: Endpoint,
    dendrite: Dendrite,
    memory: Memory,
    nucleus: N,
}

impl<N: Nucleus> Neuron<N> {
    /// Builds a node with a throwaway self-signed TLS identity.
    pub fn new(config: NeuronConfig, nucleus: N) -> Result<Arc<Self>, Error> {
        let tls = TlsIdentity::self_signed(&config.identity)?;
        Self::with_tls(config, nucleus, &tls)
    }

    /// Builds a node with the given TLS identity, e.g. one loaded from PEM.
    pub fn with_tls(
        config: NeuronConfig,
        nucleus: N,
        tls: &TlsIdentity,
    ) -> Result<Arc<Self>, Error> {
        let endpoint = Endpoint::new(config.bind_addr, tls)?;
        let dendrite = Dendrite::new(
            config.identity.clone(),
            config.k,
            config.peer_timeout,
            config.feature_dim,
        );
        let memory = Memory::new(config.max_entries, config.entry_ttl);
        Ok(Arc::new(Self {
            config,
            endpoint,
            dendrite,
            memory,
            nucleus,
        }))
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// The address the endpoint actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.endpoint.local_addr()
    }

    pub fn dendrite(&self) -> &Dendrite {
        &self.dendrite
    }

    pub fn nucleus(&self) -> &N {
        &self.nucleus
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Starts serving inbound RPCs.
    pub fn serve(self: &Arc<Self>) {
        self.endpoint
            .serve(self.clone(), self.config.max_inflight_rpcs);
        info!(identity = %self.config.identity, "serving");
    }

    /// Connects a downstream peer into the given slot.
    pub async fn connect_peer(
        &self,
        slot: usize,
        remote: SocketAddr,
        remote_name: &str,
    ) -> Result<(), Error> {
        let axon = self.endpoint.connect(remote, remote_name).await?;
        self.dendrite.attach(slot, axon).await;
        Ok(())
    }

    /// One sweep over the cache: apply every parked local gradient, evict
    /// what was applied, expire what went stale.
    pub async fn learn(&self) -> SweepStats {
        self.memory
            .sweep(|_buffer, lgrads| self.nucleus.learn(lgrads))
            .await
    }

    /// Spawns the periodic learn sweep.
    pub fn start_learner(self: &Arc<Self>) {
        let neuron = self.clone();
        let interval = self.config.learn_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                ticker.tick().await;
                let stats = neuron.learn().await;
                if stats != SweepStats::default() {
                    debug!(
                        applied = stats.applied,
                        failed = stats.failed,
                        expired = stats.expired,
                        "learn sweep"
                    );
                }
            }
        });
    }

    /// Stops accepting new work and waits for in-flight streams to drain.
    /// The learner task dies with the runtime.
    pub async fn shutdown(&self) {
        self.endpoint.close();
        self.endpoint.wait_idle().await;
    }
}

impl<N: Nucleus> NeuronService for Neuron<N> {
    fn identity(&self) -> &str {
        &self.config.identity
    }

    fn spike(
        &self,
        sender: String,
        id: MessageId,
        payload: Tensor,
    ) -> impl Future<Output = Result<Tensor, Error>> + Send {
        let span = debug_span!("spike", id = %id, sender = %sender);
        async move {
            if !payload.well_formed() {
                return Err(Error::MalformedTensor);
            }
            self.memory
                .get_or_init(id, || async {
                    let dspikes = self.dendrite.spike(id, &payload).await;
                    let lspikes = self.nucleus.spike(&payload, &dspikes)?;
                    debug!("forward pass complete");
                    Ok::<_, Error>(Buffer {
                        sender_id: sender.clone(),
                        uspikes: payload.clone(),
                        dspikes,
                        lspikes,
                    })
                })
                .await
        }
        .instrument(span)
    }

    fn grade(
        &self,
        sender: String,
        id: MessageId,
        ugrades: Tensor,
    ) -> impl Future<Output = Result<bool, Error>> + Send {
        let span = debug_span!("grade", id = %id, sender = %sender);
        async move {
            if !ugrades.well_formed() {
                return Err(Error::MalformedTensor);
            }
            let Some(entry) = self.memory.find(&id).await else {
                debug!("no buffered forward pass for this id");
                return Ok(false);
            };
            match entry.buffer() {
                // find() only returns entries with an initialized buffer
                None => Ok(false),
                Some(buffer) => {
                    entry
                        .grade_once(|| async {
                            let (dgrades, lgrads) = self.nucleus.grade(
                                &ugrades,
                                &buffer.uspikes,
                                &buffer.dspikes,
                            )?;
                            self.dendrite.grade(id, dgrades).await;
                            debug!("backward pass complete");
                            Ok::<_, Error>(lgrads)
                        })
                        .await?;
                    Ok(true)
                }
            }
        }
        .instrument(span)
    }
}
