use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use synapse::{
    Axon, Endpoint, Error, MessageId, Neuron, NeuronConfig, NeuronService,
    Nucleus, NucleusError, Tensor, TlsIdentity,
};

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

fn config(identity: &str, k: usize, feature_dim: u32) -> NeuronConfig {
    NeuronConfig::builder()
        .identity(identity.to_string())
        .bind_addr(loopback())
        .k(k)
        .feature_dim(feature_dim)
        .peer_timeout(Duration::from_millis(250))
        // sweeps are driven explicitly in these tests
        .learn_interval(Duration::from_secs(3600))
        .build()
}

async fn driver_axon(target: SocketAddr) -> (Endpoint, Axon) {
    let tls = TlsIdentity::self_signed("driver").unwrap();
    let ep = Endpoint::new(loopback(), &tls).unwrap();
    let axon = ep.connect(target, "peer").await.unwrap();
    (ep, axon)
}

/// Adds the downstream responses onto the upstream activation elementwise.
/// Splits gradients in half on the way back. Counts every call.
struct SumNucleus {
    spikes: AtomicUsize,
    grades: AtomicUsize,
    learns: AtomicUsize,
}

impl SumNucleus {
    fn new() -> Self {
        Self {
            spikes: AtomicUsize::new(0),
            grades: AtomicUsize::new(0),
            learns: AtomicUsize::new(0),
        }
    }
}

impl Nucleus for SumNucleus {
    fn spike(
        &self,
        uspikes: &Tensor,
        dspikes: &[Tensor],
    ) -> Result<Tensor, NucleusError> {
        self.spikes.fetch_add(1, Ordering::SeqCst);
        let mut out = uspikes.clone();
        for d in dspikes {
            for (o, v) in out.data.iter_mut().zip(&d.data) {
                *o += v;
            }
        }
        Ok(out)
    }

    fn grade(
        &self,
        ugrades: &Tensor,
        _uspikes: &Tensor,
        dspikes: &[Tensor],
    ) -> Result<(Vec<Tensor>, Tensor), NucleusError> {
        self.grades.fetch_add(1, Ordering::SeqCst);
        let half = Tensor::new(
            ugrades.rows,
            ugrades.cols,
            ugrades.data.iter().map(|v| v * 0.5).collect(),
        );
        Ok((vec![half; dspikes.len()], ugrades.clone()))
    }

    fn learn(&self, _lgrads: &Tensor) -> Result<(), NucleusError> {
        self.learns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Leaf transform answering a constant row, recording every gradient it is
/// handed.
struct LeafNucleus {
    row: Vec<f32>,
    spikes: AtomicUsize,
    received: Mutex<Vec<Tensor>>,
}

impl LeafNucleus {
    fn new(row: Vec<f32>) -> Self {
        Self {
            row,
            spikes: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }
}

impl Nucleus for LeafNucleus {
    fn spike(
        &self,
        uspikes: &Tensor,
        _dspikes: &[Tensor],
    ) -> Result<Tensor, NucleusError> {
        self.spikes.fetch_add(1, Ordering::SeqCst);
        let mut data = Vec::with_capacity(
            uspikes.rows as usize * self.row.len(),
        );
        for _ in 0..uspikes.rows {
            data.extend_from_slice(&self.row);
        }
        Ok(Tensor::new(uspikes.rows, self.row.len() as u32, data))
    }

    fn grade(
        &self,
        ugrades: &Tensor,
        _uspikes: &Tensor,
        dspikes: &[Tensor],
    ) -> Result<(Vec<Tensor>, Tensor), NucleusError> {
        self.received.lock().unwrap().push(ugrades.clone());
        Ok((
            vec![Tensor::zeros(ugrades.rows, ugrades.cols); dspikes.len()],
            ugrades.clone(),
        ))
    }

    fn learn(&self, _lgrads: &Tensor) -> Result<(), NucleusError> {
        Ok(())
    }
}

/// A peer that takes longer than anyone is willing to wait.
struct SleepyService;

impl NeuronService for SleepyService {
    fn identity(&self) -> &str {
        "sleepy"
    }

    async fn spike(
        &self,
        _sender: String,
        _id: MessageId,
        payload: Tensor,
    ) -> Result<Tensor, Error> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(Tensor::zeros(payload.rows, payload.cols))
    }

    async fn grade(
        &self,
        _sender: String,
        _id: MessageId,
        _grad: Tensor,
    ) -> Result<bool, Error> {
        Ok(true)
    }
}

#[tokio::test]
async fn end_to_end_spike_grade_learn() {
    let b = Neuron::new(
        config("B", 0, 2),
        LeafNucleus::new(vec![0.1, 0.1]),
    )
    .unwrap();
    let c = Neuron::new(
        config("C", 0, 2),
        LeafNucleus::new(vec![0.2, 0.2]),
    )
    .unwrap();
    let root = Neuron::new(config("R", 2, 2), SumNucleus::new()).unwrap();
    b.serve();
    c.serve();
    root.serve();
    root.connect_peer(0, b.local_addr().unwrap(), "B").await.unwrap();
    root.connect_peer(1, c.local_addr().unwrap(), "C").await.unwrap();

    let (_driver, axon) = driver_axon(root.local_addr().unwrap()).await;
    let uspikes = Tensor::new(1, 2, vec![1.0, 2.0]);
    let id = MessageId::digest("A", &uspikes);

    let (responder, lspikes) =
        axon.spike("A".to_string(), id, uspikes).await.unwrap();
    assert_eq!(responder, "R");
    assert_eq!((lspikes.rows, lspikes.cols), (1, 2));
    assert!((lspikes.data[0] - 1.3).abs() < 1e-6);
    assert!((lspikes.data[1] - 2.3).abs() < 1e-6);
    assert_eq!(b.nucleus().spikes.load(Ordering::SeqCst), 1);
    assert_eq!(c.nucleus().spikes.load(Ordering::SeqCst), 1);

    let ugrades = Tensor::new(1, 2, vec![0.1, 0.1]);
    let accepted = axon
        .grade("A".to_string(), id, ugrades.clone())
        .await
        .unwrap();
    assert!(accepted);

    // backward fan-out reached both leaves with the halved gradient
    for leaf in [&b, &c] {
        let received = leaf.nucleus().received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].data, vec![0.05, 0.05]);
    }

    // duplicate grade is answered without recomputation
    let again = axon.grade("A".to_string(), id, ugrades).await.unwrap();
    assert!(again);
    assert_eq!(root.nucleus().grades.load(Ordering::SeqCst), 1);
    for leaf in [&b, &c] {
        assert_eq!(leaf.nucleus().received.lock().unwrap().len(), 1);
    }

    // learn applies the parked gradient exactly once and drains the cache
    let stats = root.learn().await;
    assert_eq!((stats.applied, stats.failed, stats.expired), (1, 0, 0));
    assert_eq!(root.nucleus().learns.load(Ordering::SeqCst), 1);
    let stats = root.learn().await;
    assert_eq!(stats.applied, 0);

    // the entry is gone, so the same id now grades as unknown
    let gone = axon
        .grade("A".to_string(), id, Tensor::new(1, 2, vec![0.1, 0.1]))
        .await
        .unwrap();
    assert!(!gone);

    root.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn concurrent_duplicate_spikes_share_one_pass() {
    let root = Neuron::new(config("R", 0, 2), SumNucleus::new()).unwrap();
    root.serve();

    let (_driver, axon) = driver_axon(root.local_addr().unwrap()).await;
    let uspikes = Tensor::new(1, 2, vec![3.0, 4.0]);
    let id = MessageId::digest("A", &uspikes);

    let (first, second) = tokio::join!(
        axon.spike("A".to_string(), id, uspikes.clone()),
        axon.spike("A".to_string(), id, uspikes.clone())
    );
    let (_, first) = first.unwrap();
    let (_, second) = second.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.data, vec![3.0, 4.0]);
    assert_eq!(root.nucleus().spikes.load(Ordering::SeqCst), 1);

    root.shutdown().await;
}

#[tokio::test]
async fn fan_out_zero_fills_dead_and_slow_slots() {
    let live = Neuron::new(
        config("live", 0, 2),
        LeafNucleus::new(vec![0.5, 0.5]),
    )
    .unwrap();
    live.serve();

    let sleepy_tls = TlsIdentity::self_signed("sleepy").unwrap();
    let sleepy = Endpoint::new(loopback(), &sleepy_tls).unwrap();
    sleepy.serve(Arc::new(SleepyService), 4);

    // slot 1 is never attached
    let root = Neuron::new(config("R", 3, 2), SumNucleus::new()).unwrap();
    root.serve();
    root.connect_peer(0, live.local_addr().unwrap(), "live")
        .await
        .unwrap();
    root.connect_peer(2, sleepy.local_addr().unwrap(), "sleepy")
        .await
        .unwrap();

    let (_driver, axon) = driver_axon(root.local_addr().unwrap()).await;
    let uspikes = Tensor::new(1, 2, vec![1.0, 1.0]);
    let id = MessageId::digest("A", &uspikes);
    let (_, lspikes) =
        axon.spike("A".to_string(), id, uspikes).await.unwrap();

    // only the live slot contributes, the dead and slow ones come up zero
    assert!((lspikes.data[0] - 1.5).abs() < 1e-6);
    assert!((lspikes.data[1] - 1.5).abs() < 1e-6);

    root.shutdown().await;
    live.shutdown().await;
    sleepy.close();
}

#[tokio::test]
async fn grade_without_spike_is_a_rejected_no_op() {
    let root = Neuron::new(config("R", 0, 2), SumNucleus::new()).unwrap();
    root.serve();

    let (_driver, axon) = driver_axon(root.local_addr().unwrap()).await;
    let ugrades = Tensor::new(1, 2, vec![0.1, 0.1]);
    let id = MessageId::digest("A", &ugrades);

    let accepted =
        axon.grade("A".to_string(), id, ugrades.clone()).await.unwrap();
    assert!(!accepted);
    assert_eq!(root.nucleus().grades.load(Ordering::SeqCst), 0);

    // the no-op left nothing behind that a later sweep could trip on
    let stats = root.learn().await;
    assert_eq!((stats.applied, stats.failed, stats.expired), (0, 0, 0));

    root.shutdown().await;
}

#[tokio::test]
async fn malformed_payload_is_refused_remotely() {
    let root = Neuron::new(config("R", 0, 2), SumNucleus::new()).unwrap();
    root.serve();

    let (_driver, axon) = driver_axon(root.local_addr().unwrap()).await;
    let broken = Tensor::new(2, 2, vec![0.0; 3]);
    let id = MessageId::digest("A", &broken);

    let res = axon.spike("A".to_string(), id, broken).await;
    assert!(matches!(res, Err(Error::Remote(_))));
    assert_eq!(root.nucleus().spikes.load(Ordering::SeqCst), 0);

    root.shutdown().await;
}

#[tokio::test]
async fn learn_only_evicts_graded_entries() {
    let root = Neuron::new(config("R", 0, 2), SumNucleus::new()).unwrap();
    root.serve();

    let (_driver, axon) = driver_axon(root.local_addr().unwrap()).await;
    let first = Tensor::new(1, 2, vec![1.0, 1.0]);
    let second = Tensor::new(1, 2, vec![2.0, 2.0]);
    let first_id = MessageId::digest("A", &first);
    let second_id = MessageId::digest("A", &second);

    axon.spike("A".to_string(), first_id, first).await.unwrap();
    axon.spike("A".to_string(), second_id, second).await.unwrap();
    let accepted = axon
        .grade("A".to_string(), first_id, Tensor::new(1, 2, vec![0.1, 0.1]))
        .await
        .unwrap();
    assert!(accepted);

    let stats = root.learn().await;
    assert_eq!((stats.applied, stats.failed, stats.expired), (1, 0, 0));

    // the ungraded pass is still there and can be graded afterwards
    let accepted = axon
        .grade("A".to_string(), second_id, Tensor::new(1, 2, vec![0.2, 0.2]))
        .await
        .unwrap();
    assert!(accepted);
    let stats = root.learn().await;
    assert_eq!(stats.applied, 1);

    root.shutdown().await;
}
