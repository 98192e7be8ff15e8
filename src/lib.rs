pub mod neuron;

pub use neuron::{
    config::NeuronConfig,
    dendrite::{Dendrite, PeerReply},
    memory::{Buffer, Memory, SweepStats},
    net::{
        axon::Axon,
        endpoint::{Endpoint, TlsIdentity},
        error::Error,
        wire::{MessageId, Tensor},
        NeuronService, SYNAPSE_PORT,
    },
    nucleus::{GainNucleus, Nucleus, NucleusError},
    Neuron,
};
