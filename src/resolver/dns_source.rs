//! Upstream DNS source over UDP, TCP or TCP-TLS.
//!
//! Each source owns a bounded work channel drained by a pool of worker
//! tasks sized by request pressure. UDP workers open a fresh socket per
//! request; TCP and TLS workers hold a persistent connection and reopen
//! it when the peer drops it. Any transport failure puts the source into
//! a short backoff during which it refuses work, letting the resolver
//! move to its next source.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::error::{GudgeonError, Result};

const MAX_WORKERS: usize = 25;
const REQUEST_BUFFER: usize = 100;
const WORKER_IDLE: Duration = Duration::from_secs(10);
const BACKOFF_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_DEADLINE: Duration = Duration::from_secs(1);
const READ_DEADLINE: Duration = Duration::from_secs(2);
const MAX_UDP_MESSAGE: usize = 4096;

const DEFAULT_PORT: u16 = 53;
const DEFAULT_TLS_PORT: u16 = 853;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    TcpTls,
}

impl Protocol {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Some(Self::Udp),
            "tcp" => Some(Self::Tcp),
            "tcp-tls" => Some(Self::TcpTls),
            _ => None,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::TcpTls => DEFAULT_TLS_PORT,
            _ => DEFAULT_PORT,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::TcpTls => "tcp-tls",
        }
    }
}

/// Skips all certificate verification. Upstream TLS sources are used
/// unverified; the operator opts in by configuring a tcp-tls endpoint.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

struct Work {
    request: Message,
    reply: oneshot::Sender<Result<Message>>,
}

struct Shared {
    name: String,
    remote: SocketAddr,
    server_name: ServerName<'static>,
    protocol: Protocol,
    tls: Option<TlsConnector>,
    work_rx: Mutex<mpsc::Receiver<Work>>,
    closing: AtomicBool,
    workers: AtomicUsize,
}

pub struct DnsSource {
    shared: Arc<Shared>,
    // guards the sender so closing cannot race an in-flight submit
    work_tx: std::sync::RwLock<Option<mpsc::Sender<Work>>>,
    backoff_until: std::sync::Mutex<Option<Instant>>,
}

/// Splits `host[:port][/proto]` into its parts, applying protocol and
/// port defaults.
fn parse_spec(spec: &str) -> Result<(String, u16, Protocol)> {
    let (addr, protocol) = match spec.rsplit_once('/') {
        Some((addr, proto)) => (
            addr,
            Protocol::parse(proto).ok_or_else(|| {
                GudgeonError::Config(format!("unknown protocol in source spec '{spec}'"))
            })?,
        ),
        None => (spec, Protocol::Udp),
    };

    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            let port = port
                .parse()
                .map_err(|_| GudgeonError::Config(format!("bad port in source spec '{spec}'")))?;
            (host, port)
        }
        _ => (addr, protocol.default_port()),
    };
    if host.is_empty() {
        return Err(GudgeonError::Config(format!("empty host in source spec '{spec}'")));
    }
    Ok((host.to_string(), port, protocol))
}

impl DnsSource {
    pub fn new(spec: &str) -> Result<Self> {
        let (host, port, protocol) = parse_spec(spec)?;

        // hostnames resolve once at load time
        let remote = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => (host.as_str(), port)
                .to_socket_addrs()
                .map_err(|e| GudgeonError::Config(format!("resolving '{host}': {e}")))?
                .next()
                .ok_or_else(|| GudgeonError::Config(format!("no address for '{host}'")))?,
        };

        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| GudgeonError::Config(format!("bad server name '{host}'")))?;

        let tls = match protocol {
            Protocol::TcpTls => {
                let config = rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerify))
                    .with_no_client_auth();
                Some(TlsConnector::from(Arc::new(config)))
            }
            _ => None,
        };

        let name = match protocol {
            Protocol::Udp => remote.to_string(),
            _ => format!("{}/{}", remote, protocol.as_str()),
        };

        let (work_tx, work_rx) = mpsc::channel(REQUEST_BUFFER);
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                remote,
                server_name,
                protocol,
                tls,
                work_rx: Mutex::new(work_rx),
                closing: AtomicBool::new(false),
                workers: AtomicUsize::new(0),
            }),
            work_tx: std::sync::RwLock::new(Some(work_tx)),
            backoff_until: std::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    /// Forwards the request through the worker pool. `Ok(None)` means the
    /// source declined (backoff window, no recursion desired); errors set
    /// the backoff and surface to the resolver.
    pub async fn answer(&self, request: &Message) -> Result<Option<Message>> {
        {
            let mut guard = self.backoff_until.lock().unwrap();
            match *guard {
                Some(until) if Instant::now() < until => return Ok(None),
                _ => *guard = None,
            }
        }

        // only serve recursive queries
        if !request.recursion_desired() {
            return Ok(None);
        }

        let tx = {
            let guard = self.work_tx.read().unwrap();
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => {
                    return Err(GudgeonError::Transport(format!(
                        "source '{}' closed",
                        self.shared.name
                    )))
                }
            }
        };

        self.grow_workers(&tx);

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx
            .send(Work {
                request: request.clone(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Err(GudgeonError::Transport(format!(
                "source '{}' closed",
                self.shared.name
            )));
        }

        match reply_rx.await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(e)) => {
                self.set_backoff();
                Err(e)
            }
            Err(_) => {
                self.set_backoff();
                Err(GudgeonError::Transport(format!(
                    "source '{}' dropped the request",
                    self.shared.name
                )))
            }
        }
    }

    /// Pressure controller: spawn a worker when the pool is empty or the
    /// queue is more than half full and below the worker ceiling.
    fn grow_workers(&self, tx: &mpsc::Sender<Work>) {
        let workers = self.shared.workers.load(Ordering::SeqCst);
        let pending = REQUEST_BUFFER.saturating_sub(tx.capacity());
        if workers == 0 || (workers < MAX_WORKERS && pending > REQUEST_BUFFER / 2) {
            self.shared.workers.fetch_add(1, Ordering::SeqCst);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                run_worker(&shared).await;
                shared.workers.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    fn set_backoff(&self) {
        let mut guard = self.backoff_until.lock().unwrap();
        *guard = Some(Instant::now() + BACKOFF_INTERVAL);
    }

    /// Stops accepting work and waits for the worker pool to drain.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        {
            let mut guard = self.work_tx.write().unwrap();
            guard.take();
        }
        debug!("Closing dns source: {}", self.shared.name);
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.shared.workers.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn run_worker(shared: &Shared) {
    trace!("Starting '{}' {} worker", shared.name, shared.protocol.as_str());
    match shared.protocol {
        Protocol::Udp => udp_worker(shared).await,
        Protocol::Tcp | Protocol::TcpTls => tcp_worker(shared).await,
    }
    trace!("Closing '{}' worker", shared.name);
}

/// Pops the next request, retiring the worker after the idle window or
/// when the source closes the channel.
async fn next_work(shared: &Shared) -> Option<Work> {
    let mut rx = shared.work_rx.lock().await;
    match timeout(WORKER_IDLE, rx.recv()).await {
        Err(_) => None,
        Ok(work) => work,
    }
}

async fn udp_worker(shared: &Shared) {
    while let Some(work) = next_work(shared).await {
        if shared.closing.load(Ordering::SeqCst) {
            let _ = work.reply.send(Err(GudgeonError::Transport("source closing".to_string())));
            return;
        }
        let result = udp_exchange(shared, &work.request).await.map_err(map_io);
        let _ = work.reply.send(result);
    }
}

async fn udp_exchange(shared: &Shared, request: &Message) -> std::io::Result<Message> {
    let bind_addr: SocketAddr = if shared.remote.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(shared.remote).await?;

    let bytes = encode(request)?;
    deadline(WRITE_DEADLINE, socket.send(&bytes)).await?;

    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    let len = deadline(READ_DEADLINE, socket.recv(&mut buf)).await?;
    decode(&buf[..len])
}

async fn tcp_worker(shared: &Shared) {
    let mut conn = match connect(shared).await {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!("Could not establish {} connection to {}: {}", shared.protocol.as_str(), shared.name, e);
            None
        }
    };

    while let Some(work) = next_work(shared).await {
        if shared.closing.load(Ordering::SeqCst) {
            let _ = work.reply.send(Err(GudgeonError::Transport("source closing".to_string())));
            return;
        }

        if conn.is_none() {
            match connect(shared).await {
                Ok(fresh) => conn = Some(fresh),
                Err(e) => {
                    let _ = work.reply.send(Err(map_io(e)));
                    continue;
                }
            }
        }

        let stream = conn.as_mut().expect("connection present");
        match tcp_exchange(stream, &work.request).await {
            Ok(response) => {
                let _ = work.reply.send(Ok(response));
            }
            Err(e) => {
                conn = None;
                // a dropped connection usually just means we held it too
                // long; reopen and retry once
                let result = if is_connection_drop(&e) {
                    match connect(shared).await {
                        Ok(mut fresh) => {
                            let retry = tcp_exchange(&mut fresh, &work.request).await;
                            if retry.is_ok() {
                                conn = Some(fresh);
                            }
                            retry
                        }
                        Err(connect_err) => Err(connect_err),
                    }
                } else {
                    Err(e)
                };
                let _ = work.reply.send(result.map_err(map_io));
            }
        }
    }
}

enum TcpConn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

async fn connect(shared: &Shared) -> std::io::Result<TcpConn> {
    let stream = deadline(CONNECT_TIMEOUT, TcpStream::connect(shared.remote)).await?;
    stream.set_nodelay(true).ok();
    match (&shared.tls, shared.protocol) {
        (Some(connector), Protocol::TcpTls) => {
            let tls = deadline(
                CONNECT_TIMEOUT,
                connector.connect(shared.server_name.clone(), stream),
            )
            .await?;
            Ok(TcpConn::Tls(Box::new(tls)))
        }
        _ => Ok(TcpConn::Plain(stream)),
    }
}

/// One query over an established connection using the 2-byte length
/// framing shared by TCP and TLS DNS.
async fn tcp_exchange(conn: &mut TcpConn, request: &Message) -> std::io::Result<Message> {
    match conn {
        TcpConn::Plain(stream) => framed_exchange(stream, request).await,
        TcpConn::Tls(stream) => framed_exchange(stream.as_mut(), request).await,
    }
}

async fn framed_exchange<S>(stream: &mut S, request: &Message) -> std::io::Result<Message>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let bytes = encode(request)?;
    let mut framed = Vec::with_capacity(2 + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    framed.extend_from_slice(&bytes);
    deadline(WRITE_DEADLINE, stream.write_all(&framed)).await?;

    let mut len_buf = [0u8; 2];
    deadline(READ_DEADLINE, stream.read_exact(&mut len_buf)).await?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    let mut body = vec![0u8; len];
    deadline(READ_DEADLINE, stream.read_exact(&mut body)).await?;
    decode(&body)
}

async fn deadline<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("deadline of {limit:?} exceeded"),
        )),
    }
}

fn encode(message: &Message) -> std::io::Result<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn decode(bytes: &[u8]) -> std::io::Result<Message> {
    Message::from_vec(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn is_connection_drop(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
    )
}

fn map_io(e: std::io::Error) -> GudgeonError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        GudgeonError::Timeout(READ_DEADLINE)
    } else {
        GudgeonError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn recursive_query(name: &str) -> Message {
        let mut message = Message::new();
        message.set_id(0x1234);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        message
    }

    #[test]
    fn test_parse_spec_defaults() {
        assert_eq!(
            parse_spec("8.8.8.8").unwrap(),
            ("8.8.8.8".to_string(), 53, Protocol::Udp)
        );
        assert_eq!(
            parse_spec("8.8.8.8:5353").unwrap(),
            ("8.8.8.8".to_string(), 5353, Protocol::Udp)
        );
        assert_eq!(
            parse_spec("8.8.8.8/tcp").unwrap(),
            ("8.8.8.8".to_string(), 53, Protocol::Tcp)
        );
        assert_eq!(
            parse_spec("1.1.1.1/tcp-tls").unwrap(),
            ("1.1.1.1".to_string(), 853, Protocol::TcpTls)
        );
        assert_eq!(
            parse_spec("9.9.9.9:999/tcp-tls").unwrap(),
            ("9.9.9.9".to_string(), 999, Protocol::TcpTls)
        );
        assert!(parse_spec("8.8.8.8/quic").is_err());
        assert!(parse_spec(":53").is_err());
    }

    #[test]
    fn test_source_names() {
        assert_eq!(DnsSource::new("8.8.8.8").unwrap().name(), "8.8.8.8:53");
        assert_eq!(
            DnsSource::new("8.8.8.8/tcp").unwrap().name(),
            "8.8.8.8:53/tcp"
        );
        assert_eq!(
            DnsSource::new("1.1.1.1/tcp-tls").unwrap().name(),
            "1.1.1.1:853/tcp-tls"
        );
    }

    #[tokio::test]
    async fn test_non_recursive_queries_declined() {
        let source = DnsSource::new("127.0.0.1:1/tcp").unwrap();
        let mut query = recursive_query("example.com.");
        query.set_recursion_desired(false);
        assert!(source.answer(&query).await.unwrap().is_none());
        assert_eq!(source.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_error_sets_backoff() {
        // nothing listens on port 1; connects are refused immediately
        let source = DnsSource::new("127.0.0.1:1/tcp").unwrap();
        let query = recursive_query("example.com.");

        let first = source.answer(&query).await;
        assert!(first.is_err());

        // within the backoff window the source declines without work
        let second = source.answer(&query).await;
        assert!(matches!(second, Ok(None)));

        tokio::time::sleep(BACKOFF_INTERVAL + Duration::from_millis(50)).await;
        let third = source.answer(&query).await;
        assert!(third.is_err(), "backoff should have cleared");
    }

    #[tokio::test]
    async fn test_close_drains_workers() {
        let source = DnsSource::new("127.0.0.1:1/tcp").unwrap();
        let query = recursive_query("example.com.");
        let _ = source.answer(&query).await;

        source.close().await;
        assert_eq!(source.worker_count(), 0);

        // closed source refuses further work
        let after = source.answer(&query).await;
        assert!(after.is_err());
    }

    #[tokio::test]
    async fn test_udp_roundtrip_against_local_server() {
        use hickory_proto::rr::{rdata::A, RData, Record};

        // minimal upstream answering every query with a fixed A record
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_MESSAGE];
            while let Ok((len, peer)) = server.recv_from(&mut buf).await {
                let request = Message::from_vec(&buf[..len]).unwrap();
                let mut response = Message::new();
                response.set_id(request.id());
                response.set_message_type(hickory_proto::op::MessageType::Response);
                let query = request.queries().first().unwrap().clone();
                let name = query.name().clone();
                response.add_query(query);
                response.add_answer(Record::from_rdata(
                    name,
                    60,
                    RData::A(A::new(192, 0, 2, 7)),
                ));
                let _ = server.send_to(&response.to_vec().unwrap(), peer).await;
            }
        });

        let source = DnsSource::new(&addr.to_string()).unwrap();
        let query = recursive_query("example.com.");
        let response = source.answer(&query).await.unwrap().unwrap();
        assert_eq!(response.id(), query.id());
        assert_eq!(response.answers().len(), 1);
        assert!(source.worker_count() >= 1);
    }
}
