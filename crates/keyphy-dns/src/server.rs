//! Sinkholing DNS server: answers A/AAAA for blocked names with loopback and
//! forwards everything else to a fixed upstream resolver.

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use keyphy_core::config::DnsCfg;
use keyphy_core::error::{KeyphyError, KeyphyResult};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// TTL on synthesized sinkhole records.
pub const SINKHOLE_TTL: u32 = 60;

const MAX_DATAGRAM: usize = 4096;

/// Case-insensitive blocklist; `example.com` also covers `ads.example.com`.
#[derive(Debug, Default)]
pub struct Blocklist {
    domains: RwLock<HashSet<String>>,
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl Blocklist {
    pub fn insert(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        if domain.is_empty() {
            return false;
        }
        self.domains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain)
    }

    pub fn remove(&self, domain: &str) -> bool {
        self.domains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&normalize(domain))
    }

    pub fn clear(&self) {
        self.domains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        let name = normalize(name);
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidate = name.as_str();
        loop {
            if domains.contains(candidate) {
                return true;
            }
            match candidate.find('.') {
                Some(idx) => candidate = &candidate[idx + 1..],
                None => return false,
            }
        }
    }
}

/// Per-query logic, shared by every in-flight request task.
#[derive(Debug)]
struct Resolver {
    blocklist: Blocklist,
    upstream: SocketAddr,
    upstream_timeout: Duration,
}

impl Resolver {
    async fn resolve(&self, request: &Message) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(true);
        response.add_queries(request.queries().iter().cloned());

        for query in request.queries() {
            let name = query.name().to_ascii();
            if self.blocklist.contains(&name) {
                info!("sinkholed {} {}", query.query_type(), normalize(&name));
                response.set_authoritative(true);
                sinkhole(&mut response, query);
                continue;
            }
            match self.forward(query).await {
                Ok(upstream) => {
                    response.add_answers(upstream.answers().iter().cloned());
                    response.add_name_servers(upstream.name_servers().iter().cloned());
                    response.add_additionals(upstream.additionals().iter().cloned());
                    if upstream.response_code() != ResponseCode::NoError {
                        response.set_response_code(upstream.response_code());
                    }
                }
                Err(err) => {
                    warn!("upstream lookup for {name} failed: {err}");
                    response.set_response_code(ResponseCode::ServFail);
                }
            }
        }
        response
    }

    async fn forward(&self, query: &Query) -> KeyphyResult<Message> {
        let id: u16 = rand::random();
        let mut outbound = Message::new();
        outbound
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        outbound.add_query(query.clone());
        let bytes = outbound.to_vec().map_err(dns_error)?;

        let bind_addr: SocketAddr = if self.upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.send_to(&bytes, self.upstream).await?;

        let deadline = Instant::now() + self.upstream_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (len, from) = timeout(remaining, socket.recv_from(&mut buf))
                .await
                .map_err(|_| {
                    KeyphyError::Provider(format!(
                        "upstream {} timed out after {:?}",
                        self.upstream, self.upstream_timeout
                    ))
                })??;
            if from != self.upstream {
                debug!("ignoring datagram from unexpected peer {from}");
                continue;
            }
            let reply = Message::from_vec(&buf[..len]).map_err(dns_error)?;
            if reply.id() != id {
                debug!("ignoring upstream reply with stale id {}", reply.id());
                continue;
            }
            return Ok(reply);
        }
    }
}

fn sinkhole(response: &mut Message, query: &Query) {
    let rdata = match query.query_type() {
        RecordType::A => RData::A(A(Ipv4Addr::LOCALHOST)),
        RecordType::AAAA => RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
        _ => {
            response.set_response_code(ResponseCode::NXDomain);
            return;
        }
    };
    response.add_answer(Record::from_rdata(query.name().clone(), SINKHOLE_TTL, rdata));
}

fn dns_error(err: hickory_proto::error::ProtoError) -> KeyphyError {
    KeyphyError::Provider(format!("dns wire error: {err}"))
}

struct Listener {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// UDP DNS server with a runtime-mutable blocklist.
pub struct DnsBlockingServer {
    resolver: Arc<Resolver>,
    candidates: Vec<SocketAddr>,
    privileged: SocketAddr,
    listener: Mutex<Option<Listener>>,
    running: Arc<AtomicBool>,
}

impl DnsBlockingServer {
    pub fn from_config(cfg: &DnsCfg) -> KeyphyResult<Self> {
        Ok(Self::new(
            cfg.listen_addrs()?,
            cfg.privileged_socket()?,
            cfg.upstream_socket()?,
            cfg.upstream_timeout(),
        ))
    }

    pub fn new(
        candidates: Vec<SocketAddr>,
        privileged: SocketAddr,
        upstream: SocketAddr,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            resolver: Arc::new(Resolver {
                blocklist: Blocklist::default(),
                upstream,
                upstream_timeout,
            }),
            candidates,
            privileged,
            listener: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind the first candidate address that accepts us and start serving.
    pub async fn start(&self) -> KeyphyResult<SocketAddr> {
        if self.is_running() {
            return Err(KeyphyError::Provider("dns server already running".into()));
        }
        let candidates = self.candidates.clone();
        self.bind_and_serve(&candidates).await
    }

    async fn bind_and_serve(&self, candidates: &[SocketAddr]) -> KeyphyResult<SocketAddr> {
        let mut failures = Vec::new();
        for candidate in candidates {
            match UdpSocket::bind(candidate).await {
                Ok(socket) => {
                    let addr = socket.local_addr()?;
                    self.serve(socket, addr);
                    info!("dns server listening on {addr}");
                    return Ok(addr);
                }
                Err(err) => {
                    debug!("dns bind {candidate} failed: {err}");
                    failures.push(format!("{candidate}: {err}"));
                }
            }
        }
        Err(KeyphyError::DnsBind(failures.join("; ")))
    }

    fn serve(&self, socket: UdpSocket, addr: SocketAddr) {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let socket = Arc::new(socket);
        let resolver = self.resolver.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = socket.recv_from(&mut buf) => {
                        let (len, peer) = match received {
                            Ok(pair) => pair,
                            Err(err) => {
                                warn!("dns socket {addr} failed: {err}");
                                break;
                            }
                        };
                        let request = match Message::from_vec(&buf[..len]) {
                            Ok(request) => request,
                            Err(err) => {
                                debug!("dropping malformed query from {peer}: {err}");
                                continue;
                            }
                        };
                        let socket = socket.clone();
                        let resolver = resolver.clone();
                        tokio::spawn(async move {
                            let response = resolver.resolve(&request).await;
                            match response.to_vec() {
                                Ok(bytes) => {
                                    if let Err(err) = socket.send_to(&bytes, peer).await {
                                        debug!("reply to {peer} failed: {err}");
                                    }
                                }
                                Err(err) => warn!("failed to encode dns response: {err}"),
                            }
                        });
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(Listener {
            addr,
            shutdown,
            handle,
        });
    }

    /// Stop serving and release the socket.
    pub async fn stop(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            let _ = listener.shutdown.send(true);
            if let Err(err) = listener.handle.await {
                warn!("dns listener task ended abnormally: {err}");
            }
            info!("dns server on {} stopped", listener.addr);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop and rebind on the privileged address. When the port is still
    /// taken the server comes back on the regular candidates and the bind
    /// error is returned.
    pub async fn rebind_privileged(&self) -> KeyphyResult<SocketAddr> {
        self.stop().await;
        match self.bind_and_serve(&[self.privileged]).await {
            Ok(addr) => Ok(addr),
            Err(err) => {
                warn!("privileged rebind on {} failed: {err}", self.privileged);
                self.start().await?;
                Err(err)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|listener| listener.addr)
    }

    pub fn on_privileged_port(&self) -> bool {
        self.is_running()
            && self
                .local_addr()
                .is_some_and(|addr| addr.port() == self.privileged.port())
    }

    pub fn block_domain(&self, domain: &str) {
        if self.resolver.blocklist.insert(domain) {
            info!("blocked domain {}", normalize(domain));
        }
    }

    pub fn unblock_domain(&self, domain: &str) {
        if self.resolver.blocklist.remove(domain) {
            info!("unblocked domain {}", normalize(domain));
        }
    }

    pub fn unblock_all(&self) {
        self.resolver.blocklist.clear();
        info!("unblocked all domains");
    }

    pub fn is_blocked(&self, domain: &str) -> bool {
        self.resolver.blocklist.contains(domain)
    }

    pub fn blocked_count(&self) -> usize {
        self.resolver.blocklist.len()
    }

    /// Answer one query without touching the network listener.
    pub async fn resolve(&self, request: &Message) -> Message {
        self.resolver.resolve(request).await
    }
}
