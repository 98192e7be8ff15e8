use std::{
    io::{self, BufReader, Cursor},
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::Duration,
};

use quinn::default_runtime;
use rustls::{Certificate as RustlsCert, PrivateKey};
use tokio::sync::Semaphore;
use tracing::{debug, debug_span, Instrument};

use super::{
    axon::{Axon, RpcRecvStream, RpcSendStream},
    error::Error,
    wire::{Request, Response},
    NeuronService,
};

/// The TLS material a node presents. Peers do not verify it, the transport
/// only uses it to satisfy the QUIC handshake.
pub struct TlsIdentity {
    cert_chain: Vec<RustlsCert>,
    key: PrivateKey,
}

impl TlsIdentity {
    /// Generates a throwaway self-signed certificate for `common_name`.
    pub fn self_signed(common_name: &str) -> Result<Self, Error> {
        let cert = rcgen::generate_simple_self_signed(vec![
            common_name.to_string()
        ])
        .map_err(|e| Error::BadIdentity(e.to_string()))?;
        let der = cert
            .serialize_der()
            .map_err(|e| Error::BadIdentity(e.to_string()))?;
        let key = cert.serialize_private_key_der();
        Ok(Self {
            cert_chain: vec![RustlsCert(der)],
            key: PrivateKey(key),
        })
    }

    /// Loads a PEM certificate chain and exactly one PKCS#8 private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, Error> {
        let cert_chain =
            rustls_pemfile::certs(&mut BufReader::new(Cursor::new(cert_pem)))?
                .into_iter()
                .map(RustlsCert)
                .collect::<Vec<_>>();
        if cert_chain.is_empty() {
            return Err(Error::BadIdentity(
                "no certificates in pem".to_string(),
            ));
        }
        let mut keys = rustls_pemfile::pkcs8_private_keys(
            &mut BufReader::new(Cursor::new(key_pem)),
        )?;
        if keys.len() != 1 {
            return Err(Error::BadIdentity(format!(
                "expected exactly one private key, found {}",
                keys.len()
            )));
        }
        Ok(Self {
            cert_chain,
            key: PrivateKey(keys.remove(0)),
        })
    }
}

struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &RustlsCert,
        _intermediates: &[RustlsCert],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// One QUIC endpoint doing double duty: it accepts inbound RPC streams for
/// a service and opens outbound axons to downstream peers.
pub struct Endpoint {
    ep: quinn::Endpoint,
}

impl Endpoint {
    /// Creates a new QUIC endpoint bound to the given socket address with
    /// the given TLS identity.
    pub fn new(
        bind_addr: SocketAddr,
        identity: &TlsIdentity,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(bind_addr)?;
        let runtime = default_runtime().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no async runtime found")
        })?;

        let (client_tls, server_tls) = Self::tls_config(identity)?;

        // shared transport configuration for the server and client sides
        // this is the default config with the BBR congestion controller enabled
        let mut transport_config = quinn::TransportConfig::default();
        let bbr_config = quinn::congestion::BbrConfig::default();
        transport_config.congestion_controller_factory(Arc::new(bbr_config));
        transport_config.keep_alive_interval(Some(Duration::from_millis(25)));
        let transport_config = Arc::new(transport_config);

        let mut server_config =
            quinn::ServerConfig::with_crypto(Arc::new(server_tls));
        server_config.transport_config(transport_config.clone());

        let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
        client_config.transport_config(transport_config);

        let config = quinn::EndpointConfig::default();
        let mut ep =
            quinn::Endpoint::new(config, Some(server_config), socket, runtime)?;
        ep.set_default_client_config(client_config);

        Ok(Self { ep })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.ep.local_addr()?)
    }

    /// Starts accepting inbound connections and dispatching their RPC
    /// streams through `service`. At most `max_inflight_rpcs` handlers run
    /// at once across all connections; further streams queue on the
    /// semaphore.
    pub fn serve<S: NeuronService>(
        &self,
        service: Arc<S>,
        max_inflight_rpcs: usize,
    ) {
        let permits = Arc::new(Semaphore::new(max_inflight_rpcs));
        tokio::spawn(Self::start_acceptor(self.ep.clone(), service, permits));
    }

    /// Accepts incoming connections and spawns tasks to handle them.
    /// This will run until the endpoint is shut down, so it should be
    /// spawned in a dedicated task.
    async fn start_acceptor<S: NeuronService>(
        ep: quinn::Endpoint,
        service: Arc<S>,
        permits: Arc<Semaphore>,
    ) {
        while let Some(in_progress) = ep.accept().await {
            let service = service.clone();
            let permits = permits.clone();
            tokio::spawn(async move {
                match Axon::new(in_progress).await {
                    Ok(axon) => {
                        Self::serve_conn(axon, service, permits).await
                    }
                    Err(e) => {
                        debug!(error = ?e, "inbound connection failed")
                    }
                }
            });
        }
    }

    async fn serve_conn<S: NeuronService>(
        axon: Axon,
        service: Arc<S>,
        permits: Arc<Semaphore>,
    ) {
        let span = debug_span!("conn", remote = %axon.remote_addr());
        async move {
            loop {
                let (tx, rx) = match axon.conn().accept_bi().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(reason = ?e, "connection closed");
                        break;
                    }
                };
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let service = service.clone();
                tokio::spawn(
                    async move {
                        let _permit = permit;
                        let mut send = RpcSendStream::new(tx);
                        let mut recv = RpcRecvStream::new(rx);
                        if let Err(e) =
                            Self::handle_rpc(&mut send, &mut recv, service)
                                .await
                        {
                            debug!(error = ?e, "rpc stream failed");
                        }
                    }
                    .in_current_span(),
                );
            }
        }
        .instrument(span)
        .await
    }

    /// Reads one request, dispatches it, writes one response. Failures the
    /// service reports go back to the caller as an error response; failures
    /// of the stream itself surface here.
    async fn handle_rpc<S: NeuronService>(
        send: &mut RpcSendStream,
        recv: &mut RpcRecvStream,
        service: Arc<S>,
    ) -> Result<(), Error> {
        let request: Request = recv.receive().await?;
        let malformed = match &request {
            Request::Spike { payload, .. } => !payload.well_formed(),
            Request::Grade { grad, .. } => !grad.well_formed(),
        };
        let response = if malformed {
            Response::Error {
                reason: format!("{:?}", Error::MalformedTensor),
            }
        } else {
            match request {
                Request::Spike {
                    sender,
                    message_id,
                    payload,
                } => match service.spike(sender, message_id, payload).await {
                    Ok(payload) => Response::Spike {
                        responder: service.identity().to_string(),
                        message_id,
                        payload,
                    },
                    Err(e) => Response::Error {
                        reason: format!("{:?}", e),
                    },
                },
                Request::Grade {
                    sender,
                    message_id,
                    grad,
                } => match service.grade(sender, message_id, grad).await {
                    Ok(accepted) => Response::Grade { accepted },
                    Err(e) => Response::Error {
                        reason: format!("{:?}", e),
                    },
                },
            }
        };
        send.send(&response).await
    }

    /// Opens an axon to a downstream peer.
    pub async fn connect(
        &self,
        remote: SocketAddr,
        remote_name: &str,
    ) -> Result<Axon, Error> {
        Axon::new(self.ep.connect(remote, remote_name)?).await
    }

    /// Refuses new streams and connections.
    pub fn close(&self) {
        self.ep.close(0u32.into(), b"shutdown");
    }

    /// Waits for all in-flight streams to drain.
    pub async fn wait_idle(&self) {
        self.ep.wait_idle().await;
    }

    /// Rustls configurations for both sides. The client side deliberately
    /// skips server certificate verification; transport identity is not
    /// part of this protocol.
    fn tls_config(
        identity: &TlsIdentity,
    ) -> Result<(rustls::ClientConfig, rustls::ServerConfig), rustls::Error>
    {
        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                identity.cert_chain.clone(),
                identity.key.clone(),
            )?;

        Ok((client_config, server_config))
    }
}
