//! Connection handling for the OpalKV client with TLS support.
//!
//! A [`KvClient`] owns one authenticated, bucket-selected connection and
//! implements [`Dispatcher`] over it. Requests from any number of tasks
//! are serialized onto the socket and replies are paired back to their
//! callers by opaque, so a single connection can carry concurrent
//! operations without head-of-line blocking in the client.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use rustls::{ClientConfig, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::packet::{
    decode_response, encode_request, Magic, OpCode, RequestPacket, ResponsePacket, Status,
    HEADER_SIZE,
};
use crate::Result;

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Maximum frame size (16MB).
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Writes a packet on a connection and resolves the matching reply.
///
/// Implementations guarantee exactly one resolution per dispatched
/// request; once the returned future completes, no state for the request
/// remains.
pub trait Dispatcher: Send + Sync {
    /// Send `packet` and await its response.
    ///
    /// The packet is copied into the send buffer before the returned
    /// future is polled, so the borrowed sections only need to live for
    /// the call itself.
    fn dispatch(
        &self,
        packet: RequestPacket<'_>,
    ) -> impl Future<Output = Result<ResponsePacket>> + Send;

    /// Address of the remote end, used to annotate errors.
    fn remote_addr(&self) -> &str;

    /// Address of the local end, used to annotate errors.
    fn local_addr(&self) -> &str;
}

/// TLS configuration for client connections.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsConfig {
    /// Enable TLS encryption.
    pub enabled: bool,
    /// Server name for SNI (Server Name Indication).
    pub server_name: Option<String>,
    /// Accept invalid certificates (for testing only).
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    /// Create a new TLS config with server name.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            enabled: true,
            server_name: Some(server_name.into()),
            ..Default::default()
        }
    }

    /// Accept invalid certificates (for testing only).
    pub fn accept_invalid_certs(mut self) -> Self {
        self.accept_invalid_certs = true;
        self
    }
}

/// Username/password credentials for SASL PLAIN authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordAuthenticator {
    /// Username to authenticate as.
    pub username: String,
    /// Password for the user.
    pub password: String,
}

/// Configuration for a single [`KvClient`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KvClientConfig {
    /// Address of the node, e.g. "10.0.0.1:11210".
    pub address: String,
    /// Optional TLS configuration.
    pub tls_config: Option<TlsConfig>,
    /// Bucket to select after authentication.
    pub selected_bucket: Option<String>,
    /// Credentials for SASL PLAIN authentication.
    pub authenticator: Option<PasswordAuthenticator>,
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

struct ClientInner {
    write: tokio::sync::Mutex<BoxedWrite>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<ResponsePacket>>>>,
    next_opaque: AtomicU32,
    closed: AtomicBool,
    drained: Notify,
    remote_addr: String,
    local_addr: String,
    config: Mutex<KvClientConfig>,
}

impl ClientInner {
    fn complete(&self, opaque: u32, result: Result<ResponsePacket>) {
        let sender = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            let sender = pending.remove(&opaque);
            if pending.is_empty() {
                self.drained.notify_waiters();
            }
            sender
        };

        match sender {
            // A send failure means the caller gave up on the op; there is
            // nobody left to tell.
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => debug!(opaque, "dropping reply with no pending op"),
        }
    }

    fn fail_all_pending(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);

        let senders: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            let senders = pending.drain().map(|(_, sender)| sender).collect();
            self.drained.notify_waiters();
            senders
        };

        for sender in senders {
            let _ = sender.send(Err(Error::connection(reason.to_string())));
        }
    }
}

/// One authenticated, bucket-selected connection to an OpalKV node.
#[derive(Debug)]
pub struct KvClient {
    inner: Arc<ClientInner>,
    read_task: JoinHandle<()>,
}

impl std::fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInner")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl KvClient {
    /// Connect and bootstrap a client from the given configuration.
    ///
    /// Performs the TCP (and optional TLS) connect, then authenticates
    /// with SASL PLAIN and selects the configured bucket on the live
    /// connection.
    pub async fn connect(config: KvClientConfig) -> Result<KvClient> {
        info!("connecting to OpalKV node at {}", config.address);

        let tcp_stream = timeout(
            DEFAULT_CONNECT_TIMEOUT,
            TcpStream::connect(config.address.as_str()),
        )
        .await
        .map_err(Error::Timeout)??;
        tcp_stream.set_nodelay(true)?;

        let local_addr = tcp_stream.local_addr()?.to_string();
        let remote_addr = tcp_stream.peer_addr()?.to_string();

        let (read_half, write_half): (BoxedRead, BoxedWrite) = match &config.tls_config {
            Some(tls_cfg) if tls_cfg.enabled => {
                let connector = create_tls_connector(tls_cfg)?;
                let server_name = tls_cfg.server_name.as_deref().unwrap_or("localhost");
                let server_name = ServerName::try_from(server_name)
                    .map_err(|e| Error::connection(format!("invalid server name: {}", e)))?;

                let tls_stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|e| Error::connection(format!("TLS handshake failed: {}", e)))?;

                info!("TLS connection established to {}", remote_addr);
                let (read_half, write_half) = tokio::io::split(tls_stream);
                (Box::new(read_half), Box::new(write_half))
            }
            _ => {
                let (read_half, write_half) = tcp_stream.into_split();
                (Box::new(read_half), Box::new(write_half))
            }
        };

        let inner = Arc::new(ClientInner {
            write: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            next_opaque: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
            remote_addr,
            local_addr,
            config: Mutex::new(config.clone()),
        });

        let read_task = tokio::spawn(run_read_loop(inner.clone(), read_half));

        let client = KvClient { inner, read_task };

        if let Some(auth) = &config.authenticator {
            client.sasl_auth(&auth.username, &auth.password).await?;
        }
        if let Some(bucket) = &config.selected_bucket {
            client.select_bucket(bucket).await?;
        }

        info!("connected to OpalKV node at {}", config.address);
        Ok(client)
    }

    /// Apply a new configuration to the live connection.
    ///
    /// Only the selected bucket may change; a different address, TLS
    /// setup or credentials requires a new connection.
    pub async fn reconfigure(&self, config: KvClientConfig) -> Result<()> {
        let current = self
            .inner
            .config
            .lock()
            .expect("config mutex poisoned")
            .clone();

        if config.address != current.address
            || config.tls_config != current.tls_config
            || config.authenticator != current.authenticator
        {
            return Err(Error::invalid_argument(
                "reconfigure cannot change the endpoint or credentials",
            ));
        }

        if config.selected_bucket != current.selected_bucket {
            match &config.selected_bucket {
                Some(bucket) => self.select_bucket(bucket).await?,
                None => {
                    return Err(Error::invalid_argument(
                        "reconfigure cannot deselect a bucket",
                    ));
                }
            }
        }

        *self.inner.config.lock().expect("config mutex poisoned") = config;
        Ok(())
    }

    /// Close the connection.
    ///
    /// Idempotent. New dispatches fail immediately; in-flight operations
    /// are allowed to drain before the socket is shut down.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("closing connection to {}", self.inner.remote_addr);

        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            // Register for the notification before checking, so a drain
            // between the check and the await cannot be missed.
            drained.as_mut().enable();
            if self
                .inner
                .pending
                .lock()
                .expect("pending mutex poisoned")
                .is_empty()
            {
                break;
            }
            drained.await;
        }

        let mut write = self.inner.write.lock().await;
        let _ = write.shutdown().await;
        self.read_task.abort();
        Ok(())
    }

    async fn sasl_auth(&self, username: &str, password: &str) -> Result<()> {
        let mut value = Vec::with_capacity(username.len() + password.len() + 2);
        value.push(0);
        value.extend_from_slice(username.as_bytes());
        value.push(0);
        value.extend_from_slice(password.as_bytes());

        let resp = self
            .dispatch(RequestPacket {
                magic: Magic::Req,
                op_code: OpCode::SaslAuth,
                key: b"PLAIN",
                value: &value,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => Ok(()),
            Status::AuthError => Err(Error::AuthenticationFailed),
            status => Err(Error::connection(format!("sasl auth failed: {}", status))),
        }
    }

    async fn select_bucket(&self, bucket: &str) -> Result<()> {
        let resp = self
            .dispatch(RequestPacket {
                magic: Magic::Req,
                op_code: OpCode::SelectBucket,
                key: bucket.as_bytes(),
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => Ok(()),
            Status::AccessError => Err(Error::AccessError),
            status => Err(Error::connection(format!("select bucket failed: {}", status))),
        }
    }
}

impl Dispatcher for KvClient {
    fn dispatch(
        &self,
        packet: RequestPacket<'_>,
    ) -> impl Future<Output = Result<ResponsePacket>> + Send {
        let inner = self.inner.clone();
        let opaque = inner.next_opaque.fetch_add(1, Ordering::SeqCst);

        // Encode into the send buffer before returning the future, so the
        // borrowed packet does not have to outlive this call.
        let mut buf = BytesMut::new();
        let encoded = encode_request(&packet, opaque, &mut buf);

        async move {
            encoded?;

            let receiver = {
                let mut pending = inner.pending.lock().expect("pending mutex poisoned");
                if inner.closed.load(Ordering::SeqCst) {
                    return Err(Error::Closed);
                }
                let (sender, receiver) = oneshot::channel();
                pending.insert(opaque, sender);
                receiver
            };

            let write_result = {
                let mut write = inner.write.lock().await;
                match write.write_all(&buf).await {
                    Ok(()) => write.flush().await,
                    Err(e) => Err(e),
                }
            };

            if let Err(e) = write_result {
                inner.complete(opaque, Err(Error::connection(e.to_string())));
            }

            receiver.await.map_err(|_| Error::Closed)?
        }
    }

    fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }
}

impl Drop for KvClient {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn run_read_loop(inner: Arc<ClientInner>, mut read: BoxedRead) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(e) = read.read_exact(&mut header).await {
            debug!("read loop ending: {}", e);
            inner.fail_all_pending(&format!("connection lost: {}", e));
            return;
        }

        let body_len =
            u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if body_len > MAX_FRAME_SIZE {
            warn!("oversized frame from {}: {} bytes", inner.remote_addr, body_len);
            inner.fail_all_pending("oversized frame received");
            return;
        }

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + body_len);
        frame.put_slice(&header);
        frame.resize(HEADER_SIZE + body_len, 0);
        if let Err(e) = read.read_exact(&mut frame[HEADER_SIZE..]).await {
            debug!("read loop ending: {}", e);
            inner.fail_all_pending(&format!("connection lost: {}", e));
            return;
        }

        match decode_response(frame.freeze()) {
            Ok(resp) => {
                let opaque = resp.opaque;
                inner.complete(opaque, Ok(resp));
            }
            Err(e) => {
                warn!("undecodable frame from {}: {}", inner.remote_addr, e);
                inner.fail_all_pending("undecodable frame received");
                return;
            }
        }
    }
}

fn create_tls_connector(tls_config: &TlsConfig) -> Result<TlsConnector> {
    let config = if tls_config.accept_invalid_certs {
        warn!("accepting invalid certificates - this should only be used for testing!");
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::empty();
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// TLS certificate verifier that accepts all certificates (for testing only).
struct AcceptAllVerifier;

impl rustls::client::ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
