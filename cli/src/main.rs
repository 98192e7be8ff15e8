use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use rand::Rng;
use synapse::{
    Endpoint, GainNucleus, MessageId, Neuron, NeuronConfig, Tensor,
    TlsIdentity,
};
use tracing::info;

const FEATURE_DIM: u32 = 4;

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

fn config(identity: &str) -> NeuronConfig {
    NeuronConfig::builder()
        .identity(identity.to_string())
        .bind_addr(loopback())
        .k(2)
        .feature_dim(FEATURE_DIM)
        .peer_timeout(Duration::from_millis(250))
        .learn_interval(Duration::from_millis(200))
        .build()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let left =
        Neuron::new(config("left"), GainNucleus::new(0.5, FEATURE_DIM))
            .unwrap();
    let right =
        Neuron::new(config("right"), GainNucleus::new(2.0, FEATURE_DIM))
            .unwrap();
    let cortex =
        Neuron::new(config("cortex"), GainNucleus::new(1.0, FEATURE_DIM))
            .unwrap();
    left.serve();
    right.serve();
    cortex.serve();
    left.start_learner();
    right.start_learner();
    cortex.start_learner();

    cortex
        .connect_peer(0, left.local_addr().unwrap(), "left")
        .await
        .unwrap();
    cortex
        .connect_peer(1, right.local_addr().unwrap(), "right")
        .await
        .unwrap();

    // the driver plays the upstream caller
    let driver_tls = TlsIdentity::self_signed("driver").unwrap();
    let driver = Endpoint::new(loopback(), &driver_tls).unwrap();
    let axon = driver
        .connect(cortex.local_addr().unwrap(), "cortex")
        .await
        .unwrap();

    let mut rng = rand::thread_rng();
    let activations: Vec<f32> =
        (0..2 * FEATURE_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let uspikes = Tensor::new(2, FEATURE_DIM, activations);
    let id = MessageId::digest("driver", &uspikes);

    let (responder, lspikes) = axon
        .spike("driver".to_string(), id, uspikes)
        .await
        .unwrap();
    info!(%responder, output = ?lspikes.data, "forward pass");

    let ugrades = Tensor::new(2, FEATURE_DIM, vec![0.1; 2 * FEATURE_DIM as usize]);
    let accepted = axon
        .grade("driver".to_string(), id, ugrades)
        .await
        .unwrap();
    info!(accepted, "backward pass");

    // give every learner a couple of ticks
    tokio::time::sleep(Duration::from_millis(600)).await;
    info!(
        cortex = cortex.nucleus().gain(),
        left = left.nucleus().gain(),
        right = right.nucleus().gain(),
        "gains after learning"
    );

    driver.close();
    cortex.shutdown().await;
    left.shutdown().await;
    right.shutdown().await;
}
