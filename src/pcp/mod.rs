//! PCP gateway (RFC 6887).
//!
//! The gateway runs as a single task owning the UDP socket, the request
//! queue and the mapping table, so all protocol state is mutated from one
//! place. Callers hold a cheap clonable handle and talk to the task over a
//! command channel; each command carries a oneshot sender for its reply.
//!
//! # Startup
//!
//! [`pcp_nat`] first probes the server with the ANNOUNCE opcode, once per
//! eligible local address with a three second budget each. The first reply
//! seeds the server epoch; when nothing answers the constructor fails and
//! no gateway is returned.
//!
//! # The epoch and recovery
//!
//! Every response carries the seconds since the server booted. The client
//! projects that onto its own clock and compares the projection with the
//! previous one: a decrease, or a drift of more than ten seconds, means the
//! server lost its state. All mappings are then re-requested with their
//! stored nonces so the server rebuilds the same table. Failures during
//! that sweep are logged and do not interrupt it.

pub(crate) mod proto;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::gateway::{ephemeral_port, fan_out, local_addresses, Family, Gateway, PortMapping};
use crate::mapping::{unix_ms, unix_s, Mapping, MappingTable};
use crate::options::{MapOptions, PcpNatOptions, Protocol, StopOptions, DEFAULT_TTL};
use crate::queue::{Pending, RequestQueue};
use crate::wire::{from_mapped, to_mapped};

use proto::{MapRequest, OpCode, Response, ResultCode};

/// Per-address budget for the ANNOUNCE probe
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(3);

/// How often the refresher scans for mappings nearing expiry
const REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Deadline for gateway-internal requests (refreshes, releases)
const INTERNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest lifetime worth requesting, in seconds
const MIN_LIFETIME: u32 = 120;

/// Lifetime of the throwaway mapping used to learn the external address
const PROBE_TTL_MS: u64 = 120_000;

/// Allowed drift between the projected and the known epoch, in seconds
const EPOCH_DRIFT: i64 = 10;

/// Creates a PCP gateway for the NAT device at `gateway`.
///
/// The device is probed with ANNOUNCE first; only a responding server
/// yields a gateway.
pub async fn pcp_nat(gateway: IpAddr, opts: PcpNatOptions) -> Result<PcpGateway> {
    let server = SocketAddr::new(gateway, proto::SERVER_PORT);
    let family = Family::of(gateway);
    let probe = announce_probe(server, family);
    let epoch = match opts.signal {
        Some(signal) => tokio::select! {
            _ = signal.cancelled() => return Err(Error::Aborted),
            result = probe => result?,
        },
        None => probe.await?,
    };
    spawn(server, Some(epoch)).await
}

/// Sends an ANNOUNCE from each eligible local address and returns the
/// projected epoch from the first reply
pub(crate) async fn announce_probe(server: SocketAddr, family: Family) -> Result<i64> {
    let addrs = local_addresses(family)?;
    if addrs.is_empty() {
        return Err(Error::NoLocalAddresses);
    }
    for addr in addrs {
        match announce_once(addr, server).await {
            Ok(epoch) => return Ok(epoch),
            Err(e) => debug!(%addr, "announce got no answer: {e}"),
        }
    }
    Err(Error::NoPcpServer)
}

async fn announce_once(local: IpAddr, server: SocketAddr) -> Result<i64> {
    let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
    socket.connect(server).await?;
    socket.send(&proto::encode_announce(to_mapped(local))).await?;

    let mut buf = [0u8; 2048];
    let wait = async {
        loop {
            let n = socket.recv(&mut buf).await?;
            match proto::decode_response(&buf[..n]) {
                Ok(resp) if resp.opcode == OpCode::Announce => {
                    if resp.result == ResultCode::Success {
                        return Ok(unix_s() as i64 - i64::from(resp.epoch));
                    }
                    return Err(Error::Gateway {
                        code: resp.result as u16,
                        message: resp.result.message().to_string(),
                    });
                }
                Ok(_) => debug!("ignoring non-announce packet during probe"),
                Err(e) => debug!("ignoring undecodable packet during probe: {e}"),
            }
        }
    };
    tokio::time::timeout(ANNOUNCE_TIMEOUT, wait)
        .await
        .map_err(|_| Error::Timeout)?
}

pub(crate) async fn spawn(server: SocketAddr, epoch: Option<i64>) -> Result<PcpGateway> {
    let family = Family::of(server.ip());
    let bind: SocketAddr = match family {
        Family::V4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
        Family::V6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    // Connecting filters out datagrams from any other source address or
    // port at the socket level
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let runner = Runner {
        socket,
        cmd_rx,
        table: MappingTable::new(),
        queue: RequestQueue::new(),
        epoch: EpochTracker { known: epoch },
        jobs: HashMap::new(),
        next_job: 0,
        closing: false,
        cmd_closed: false,
    };
    tokio::spawn(runner.run());

    Ok(PcpGateway {
        cmd: cmd_tx,
        server,
        family,
    })
}

/// Handle to a running PCP gateway task
#[derive(Clone)]
pub struct PcpGateway {
    cmd: mpsc::Sender<Cmd>,
    server: SocketAddr,
    family: Family,
}

impl PcpGateway {
    /// Re-runs the ANNOUNCE procedure against this gateway's server
    pub async fn is_pcp_supported(&self) -> Result<()> {
        announce_probe(self.server, self.family).await.map(|_| ())
    }

    async fn send_cmd(&self, cmd: Cmd) -> Result<()> {
        self.cmd.send(cmd).await.map_err(|_| Error::Closed)
    }

    async fn request_map(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: &MapOptions,
        ttl_ms: u64,
        auto_refresh: bool,
    ) -> Result<PortMapping> {
        let (protocol_raw, protocol) = opts.protocol()?;
        let lifetime = ((ttl_ms / 1000) as u32).max(MIN_LIFETIME);
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Cmd::Map {
            params: MapParams {
                host: internal_host,
                port: internal_port,
                protocol_raw: protocol_raw.clone(),
                protocol,
                lifetime,
                external_port: opts.external_port,
                auto_refresh,
                timeout: opts.refresh_timeout(),
            },
            reply,
        })
        .await?;

        match &opts.signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => {
                    self.send_cmd(Cmd::Cancel {
                        host: internal_host,
                        port: internal_port,
                        protocol: protocol_raw,
                    })
                    .await
                    .ok();
                    Err(Error::Aborted)
                }
                result = rx => result.unwrap_or(Err(Error::Closed)),
            },
            None => rx.await.unwrap_or(Err(Error::Closed)),
        }
    }

    async fn request_unmap(
        &self,
        host: Option<IpAddr>,
        port: u16,
        opts: &MapOptions,
    ) -> Result<()> {
        let (protocol_raw, _) = opts.protocol()?;
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Cmd::Unmap {
            host,
            port,
            protocol: protocol_raw,
            timeout: opts.refresh_timeout(),
            reply,
        })
        .await?;
        match &opts.signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => Err(Error::Aborted),
                result = rx => result.unwrap_or(Err(Error::Closed)),
            },
            None => rx.await.unwrap_or(Err(Error::Closed)),
        }
    }

    /// External address discovery over a fixed address list; `external_ip`
    /// feeds it the local interface addresses
    pub(crate) async fn external_ip_via(
        &self,
        addrs: Vec<IpAddr>,
        opts: &MapOptions,
    ) -> Result<IpAddr> {
        if addrs.is_empty() {
            return Err(Error::NoLocalAddresses);
        }
        let mut last_error = Error::NoLocalAddresses;
        for addr in addrs {
            // A short-lived throwaway mapping; the assignment in the reply
            // carries the external address we are after
            let port = ephemeral_port();
            let probe_opts = MapOptions {
                protocol: Some("TCP".to_string()),
                refresh_timeout: opts.refresh_timeout,
                signal: opts.signal.clone(),
                ..Default::default()
            };
            match self
                .request_map(port, addr, &probe_opts, PROBE_TTL_MS, false)
                .await
            {
                Ok(mapping) => {
                    self.request_unmap(Some(addr), port, &probe_opts).await.ok();
                    return Ok(mapping.external_host);
                }
                Err(e @ Error::Aborted) => return Err(e),
                Err(e) => {
                    warn!(%addr, "external address probe failed: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait::async_trait]
impl Gateway for PcpGateway {
    async fn map(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: MapOptions,
    ) -> Result<PortMapping> {
        let ttl = opts.ttl_ms();
        let auto_refresh = opts.auto_refresh();
        self.request_map(internal_port, internal_host, &opts, ttl, auto_refresh)
            .await
    }

    async fn map_all(
        &self,
        internal_port: u16,
        opts: MapOptions,
    ) -> futures::stream::BoxStream<'static, Result<PortMapping>> {
        fan_out(self.clone(), self.family, internal_port, opts)
    }

    async fn unmap(&self, internal_port: u16, opts: MapOptions) -> Result<()> {
        self.request_unmap(None, internal_port, &opts).await
    }

    async fn external_ip(&self, opts: MapOptions) -> Result<IpAddr> {
        let addrs = local_addresses(self.family)?;
        self.external_ip_via(addrs, &opts).await
    }

    async fn stop(&self, opts: StopOptions) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Cmd::Stop { reply }).await?;
        match &opts.signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => Err(Error::Aborted),
                result = rx => result.unwrap_or(Err(Error::Closed)),
            },
            None => rx.await.unwrap_or(Err(Error::Closed)),
        }
    }

    async fn mappings(&self) -> Vec<Mapping> {
        let (reply, rx) = oneshot::channel();
        if self.cmd.send(Cmd::Mappings { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct MapParams {
    host: IpAddr,
    port: u16,
    protocol_raw: String,
    protocol: Protocol,
    lifetime: u32,
    external_port: Option<u16>,
    auto_refresh: bool,
    timeout: Duration,
}

enum Cmd {
    Map {
        params: MapParams,
        reply: oneshot::Sender<Result<PortMapping>>,
    },
    Unmap {
        host: Option<IpAddr>,
        port: u16,
        protocol: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        host: IpAddr,
        port: u16,
        protocol: String,
    },
    Mappings {
        reply: oneshot::Sender<Vec<Mapping>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// What a queued request was for, so its completion can be routed
enum Ctx {
    /// Caller-initiated mapping
    Map {
        host: IpAddr,
        port: u16,
        protocol: String,
    },
    /// Refresher- or remap-initiated renewal
    Refresh,
    /// Lifetime-zero delete belonging to an unmap or shutdown job
    Release { job: u64 },
}

/// A group of lifetime-zero requests whose joint outcome one caller waits on
struct Job {
    remaining: usize,
    error: Option<Error>,
    reply: Option<oneshot::Sender<Result<()>>>,
    /// Shutdown jobs end the task once they settle
    stop: bool,
}

/// Tracks the server's boot epoch as projected onto the local clock
struct EpochTracker {
    known: Option<i64>,
}

impl EpochTracker {
    /// Folds in the epoch of a received response; returns whether the
    /// server appears to have rebooted since the previous one
    fn observe(&mut self, epoch: u32, now_s: u64) -> bool {
        let projected = now_s as i64 - i64::from(epoch);
        let rebooted = match self.known {
            None => false,
            Some(known) => projected < known || (projected - known).abs() > EPOCH_DRIFT,
        };
        self.known = Some(projected);
        rebooted
    }
}

struct Runner {
    socket: UdpSocket,
    cmd_rx: mpsc::Receiver<Cmd>,
    table: MappingTable,
    queue: RequestQueue<PortMapping, Ctx>,
    epoch: EpochTracker,
    jobs: HashMap<u64, Job>,
    next_job: u64,
    closing: bool,
    cmd_closed: bool,
}

impl Runner {
    async fn run(mut self) {
        let mut buf = [0u8; 2048];
        let mut refresh = interval_at(Instant::now() + REFRESH_INTERVAL, REFRESH_INTERVAL);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.pump().await;
            let deadline = self.queue.deadline();
            let done = tokio::select! {
                cmd = self.cmd_rx.recv(), if !self.cmd_closed => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    // Every handle is gone: release the mappings and wind down
                    None => {
                        self.cmd_closed = true;
                        self.begin_close(None)
                    }
                },
                received = self.socket.recv(&mut buf) => match received {
                    Ok(n) => self.handle_datagram(&buf[..n]),
                    Err(e) => {
                        self.fail_all(Error::Io(e));
                        true
                    }
                },
                _ = refresh.tick() => {
                    self.refresh_expiring();
                    false
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.timeout_head()
                }
            };
            if done {
                break;
            }
        }
    }

    /// Puts the next queued request on the wire, if nothing is in flight
    async fn pump(&mut self) {
        loop {
            let Some(packet) = self.queue.next_to_send() else {
                return;
            };
            match self.socket.send(packet).await {
                Ok(_) => return,
                Err(e) => {
                    let Some(pending) = self.queue.complete() else {
                        return;
                    };
                    if self.fail_pending(pending, Error::Io(e)) {
                        return;
                    }
                }
            }
        }
    }

    fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        match cmd {
            Cmd::Map { params, reply } => {
                if self.closing {
                    reply.send(Err(Error::Closed)).ok();
                    return false;
                }
                let row = self.table.get_or_create(
                    params.host,
                    params.port,
                    &params.protocol_raw,
                    params.auto_refresh,
                );
                let nonce = row.nonce;
                let packet = MapRequest {
                    lifetime: params.lifetime,
                    client: to_mapped(params.host),
                    nonce,
                    protocol: params.protocol.number(),
                    internal_port: params.port,
                    suggested_external_port: params
                        .external_port
                        .or(row.external_port)
                        .unwrap_or(params.port),
                    suggested_external_addr: row
                        .external_host
                        .map(to_mapped)
                        .unwrap_or(Ipv6Addr::UNSPECIFIED),
                }
                .encode();
                self.queue.push(Pending::new(
                    OpCode::Map as u8,
                    packet,
                    Some(reply),
                    Some(nonce),
                    params.timeout,
                    Ctx::Map {
                        host: params.host,
                        port: params.port,
                        protocol: params.protocol_raw,
                    },
                ));
                false
            }
            Cmd::Unmap {
                host,
                port,
                protocol,
                timeout,
                reply,
            } => {
                if self.closing {
                    reply.send(Err(Error::Closed)).ok();
                    return false;
                }
                let rows: Vec<Mapping> = self
                    .table
                    .iter()
                    .filter(|m| {
                        m.internal_port == port
                            && m.protocol.eq_ignore_ascii_case(&protocol)
                            && host.map_or(true, |h| m.internal_host == h)
                    })
                    .cloned()
                    .collect();
                if rows.is_empty() {
                    reply.send(Ok(())).ok();
                    return false;
                }
                let job = self.new_job(rows.len(), Some(reply), false);
                for row in rows {
                    self.enqueue_release(&row, timeout, job);
                }
                false
            }
            Cmd::Cancel {
                host,
                port,
                protocol,
            } => {
                if let Some(nonce) = self.table.get(host, port, &protocol).map(|m| m.nonce) {
                    if let Some(pending) = self.queue.cancel(&nonce) {
                        pending.resolve(Err(Error::Aborted));
                    }
                    self.table.delete_by_nonce(&nonce);
                }
                false
            }
            Cmd::Mappings { reply } => {
                reply.send(self.table.snapshot()).ok();
                false
            }
            Cmd::Stop { reply } => self.begin_close(Some(reply)),
        }
    }

    /// Starts the shutdown: a lifetime-zero request per mapping, best
    /// effort, then the task ends
    fn begin_close(&mut self, reply: Option<oneshot::Sender<Result<()>>>) -> bool {
        if self.closing {
            if let Some(tx) = reply {
                tx.send(Err(Error::Closed)).ok();
            }
            return false;
        }
        self.closing = true;
        let rows = self.table.snapshot();
        if rows.is_empty() {
            if let Some(tx) = reply {
                tx.send(Ok(())).ok();
            }
            return true;
        }
        let job = self.new_job(rows.len(), reply, true);
        for row in rows {
            self.enqueue_release(&row, INTERNAL_TIMEOUT, job);
        }
        false
    }

    fn handle_datagram(&mut self, buf: &[u8]) -> bool {
        let resp = match proto::decode_response(buf) {
            Ok(resp) => resp,
            Err(e) => {
                debug!("ignoring undecodable packet: {e}");
                return false;
            }
        };
        let rebooted = self.epoch.observe(resp.epoch, unix_s());

        let done = if !self.queue.in_flight() {
            debug!("dropping response with no request in flight");
            false
        } else if !self.queue.head_matches(resp.opcode as u8) {
            // A late reply to an earlier request; the one we are waiting
            // for may still arrive
            warn!(opcode = resp.opcode as u8, "ignoring stale response");
            false
        } else {
            match self.queue.complete() {
                Some(pending) => self.process_response(pending, resp),
                None => false,
            }
        };

        if rebooted && !self.closing {
            info!("gateway epoch changed, re-requesting all mappings");
            self.remap();
        }
        done
    }

    fn process_response(&mut self, pending: Pending<PortMapping, Ctx>, resp: Response) -> bool {
        if resp.result != ResultCode::Success {
            let error = Error::Gateway {
                code: resp.result as u16,
                message: resp.result.message().to_string(),
            };
            return self.fail_pending(pending, error);
        }
        match pending.ctx {
            Ctx::Map {
                host,
                port,
                ref protocol,
            } => {
                let outcome = resp.map.as_ref().and_then(|map| {
                    self.confirm(map, protocol, resp.lifetime).then(|| PortMapping {
                        protocol: protocol.to_uppercase(),
                        internal_host: host,
                        internal_port: port,
                        external_host: from_mapped(map.external_addr),
                        external_port: map.external_port,
                    })
                });
                match outcome {
                    Some(mapping) => pending.resolve(Ok(mapping)),
                    None => {
                        if let Some(nonce) = pending.nonce {
                            self.table.delete_by_nonce(&nonce);
                        }
                        pending.resolve(Err(Error::UnknownMapping));
                    }
                }
                false
            }
            Ctx::Refresh => {
                match resp.map.as_ref() {
                    Some(map) => {
                        // The row's protocol string is what was stored at
                        // creation; recover it for the update
                        let protocol = self
                            .table
                            .get_by_nonce(&map.nonce)
                            .map(|m| m.protocol.clone());
                        match protocol {
                            Some(protocol) if self.confirm(map, &protocol, resp.lifetime) => {
                                debug!(port = map.internal_port, "mapping refreshed")
                            }
                            _ => warn!("refresh response did not match any mapping"),
                        }
                    }
                    None => warn!("refresh response carried no mapping data"),
                }
                false
            }
            Ctx::Release { job } => {
                if let Some(nonce) = pending.nonce {
                    self.table.delete_by_nonce(&nonce);
                }
                self.finish_release(job, None)
            }
        }
    }

    /// Applies a successful MAP response to the table; returns whether a
    /// row matched the (port, protocol, nonce) triple
    fn confirm(&mut self, map: &proto::MapResponse, protocol: &str, lifetime: u32) -> bool {
        let number = match Protocol::parse(protocol) {
            Ok(p) => p.number(),
            Err(_) => return false,
        };
        if map.protocol != number {
            return false;
        }
        let expires_at = (unix_s() + u64::from(lifetime)) * 1000;
        self.table.update(
            map.internal_port,
            protocol,
            &map.nonce,
            from_mapped(map.external_addr),
            map.external_port,
            expires_at,
            lifetime,
        )
    }

    /// Routes a failed request to its waiter; refresh failures are only
    /// logged so the refresher keeps trying
    fn fail_pending(&mut self, pending: Pending<PortMapping, Ctx>, error: Error) -> bool {
        match pending.ctx {
            Ctx::Map { .. } => {
                // A fresh attempt gets a fresh nonce
                if let Some(nonce) = pending.nonce {
                    self.table.delete_by_nonce(&nonce);
                }
                pending.resolve(Err(error));
                false
            }
            Ctx::Refresh => {
                warn!("mapping refresh failed: {error}");
                false
            }
            Ctx::Release { job } => {
                if let Some(nonce) = pending.nonce {
                    self.table.delete_by_nonce(&nonce);
                }
                self.finish_release(job, Some(error))
            }
        }
    }

    fn new_job(
        &mut self,
        remaining: usize,
        reply: Option<oneshot::Sender<Result<()>>>,
        stop: bool,
    ) -> u64 {
        let id = self.next_job;
        self.next_job += 1;
        self.jobs.insert(
            id,
            Job {
                remaining,
                error: None,
                reply,
                stop,
            },
        );
        id
    }

    /// Accounts one settled release; when its job is complete the waiter is
    /// notified, and a finished shutdown job ends the task
    fn finish_release(&mut self, id: u64, error: Option<Error>) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if let Some(e) = error {
            job.error.get_or_insert(e);
        }
        job.remaining -= 1;
        if job.remaining > 0 {
            return false;
        }
        let Some(job) = self.jobs.remove(&id) else {
            return false;
        };
        let result = match job.error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if let Some(tx) = job.reply {
            tx.send(result).ok();
        }
        if job.stop {
            self.table.delete_all();
            return true;
        }
        false
    }

    fn enqueue_release(&mut self, row: &Mapping, timeout: Duration, job: u64) {
        let protocol = Protocol::parse(&row.protocol).unwrap_or(Protocol::Tcp);
        let packet = MapRequest {
            lifetime: 0,
            client: to_mapped(row.internal_host),
            nonce: row.nonce,
            protocol: protocol.number(),
            internal_port: row.internal_port,
            suggested_external_port: 0,
            suggested_external_addr: Ipv6Addr::UNSPECIFIED,
        }
        .encode();
        self.queue.push(Pending::new(
            OpCode::Map as u8,
            packet,
            None,
            Some(row.nonce),
            timeout,
            Ctx::Release { job },
        ));
    }

    fn refresh_expiring(&mut self) {
        if self.closing {
            return;
        }
        let due: Vec<Mapping> = self.table.expiring(unix_ms()).cloned().collect();
        for row in due {
            self.enqueue_refresh(&row);
        }
    }

    /// Re-requests every mapping after the server lost its state
    fn remap(&mut self) {
        let rows = self.table.snapshot();
        for row in rows {
            self.enqueue_refresh(&row);
        }
    }

    fn enqueue_refresh(&mut self, row: &Mapping) {
        if self.queue.contains(&row.nonce) {
            return;
        }
        let protocol = Protocol::parse(&row.protocol).unwrap_or(Protocol::Tcp);
        let lifetime = row.lifetime.unwrap_or((DEFAULT_TTL / 1000) as u32);
        let packet = MapRequest {
            lifetime,
            client: to_mapped(row.internal_host),
            nonce: row.nonce,
            protocol: protocol.number(),
            internal_port: row.internal_port,
            suggested_external_port: row.external_port.unwrap_or(row.internal_port),
            suggested_external_addr: row
                .external_host
                .map(to_mapped)
                .unwrap_or(Ipv6Addr::UNSPECIFIED),
        }
        .encode();
        self.queue.push(Pending::new(
            OpCode::Map as u8,
            packet,
            None,
            Some(row.nonce),
            INTERNAL_TIMEOUT,
            Ctx::Refresh,
        ));
    }

    fn timeout_head(&mut self) -> bool {
        match self.queue.complete() {
            Some(pending) => self.fail_pending(pending, Error::Timeout),
            None => false,
        }
    }

    /// Transport is gone: reject everything and wind down
    fn fail_all(&mut self, error: Error) {
        let mut first = Some(error);
        for pending in self.queue.drain().collect::<Vec<_>>() {
            pending.resolve(Err(first.take().unwrap_or(Error::Closed)));
        }
        for (_, job) in self.jobs.drain() {
            if let Some(tx) = job.reply {
                tx.send(Err(Error::Closed)).ok();
            }
        }
        self.table.delete_all();
        self.closing = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::proto::{
        decode_map_request, encode_response, MapResponse, OpCode, ResultCode,
    };
    use super::*;

    struct FakeServer {
        addr: SocketAddr,
        requests: Arc<Mutex<Vec<MapRequest>>>,
    }

    /// A PCP server for the loopback interface driven by a reply policy
    async fn fake_server<F>(reply: F) -> FakeServer
    where
        F: Fn(&MapRequest, usize) -> Option<Vec<u8>> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(request) = decode_map_request(&buf[..n]) else {
                    continue;
                };
                let count = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(request.clone());
                    seen.len()
                };
                if let Some(packet) = reply(&request, count) {
                    socket.send_to(&packet, from).await.ok();
                }
            }
        });
        FakeServer { addr, requests }
    }

    fn grant(request: &MapRequest, lifetime: u32, epoch: u32) -> Vec<u8> {
        encode_response(
            OpCode::Map,
            ResultCode::Success,
            lifetime,
            epoch,
            Some(&MapResponse {
                nonce: request.nonce,
                protocol: request.protocol,
                internal_port: request.internal_port,
                external_port: if request.suggested_external_port == 0 {
                    request.internal_port
                } else {
                    request.suggested_external_port
                },
                external_addr: "1.2.3.4".parse::<Ipv4Addr>().unwrap().to_ipv6_mapped(),
            }),
        )
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn map_updates_the_table_and_returns_the_assignment() {
        let server = fake_server(|req, _| Some(grant(req, 600, 1000))).await;
        let gateway = spawn(server.addr, None).await.unwrap();

        let mapping = gateway
            .map(
                5000,
                localhost(),
                MapOptions {
                    protocol: Some("tcp".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(mapping.protocol, "TCP");
        assert_eq!(mapping.external_host, "1.2.3.4".parse::<IpAddr>().unwrap());
        assert_eq!(mapping.external_port, 5000);

        let rows = gateway.mappings().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].lifetime, Some(600));
        assert_eq!(rows[0].protocol, "tcp");
        assert!(rows[0].expires_at.is_some());

        let sent = server.requests.lock().unwrap();
        assert_eq!(sent.len(), 1);
        // the ttl default of one hour, in seconds
        assert_eq!(sent[0].lifetime, 3600);
    }

    #[tokio::test]
    async fn granted_lifetimes_above_a_day_are_clamped() {
        let server = fake_server(|req, _| Some(grant(req, 100_000, 1000))).await;
        let gateway = spawn(server.addr, None).await.unwrap();

        gateway
            .map(5000, localhost(), MapOptions::default())
            .await
            .unwrap();
        let rows = gateway.mappings().await;
        assert_eq!(rows[0].lifetime, Some(86_400));
    }

    #[tokio::test]
    async fn epoch_change_triggers_a_remap_of_every_mapping() {
        // The first two responses pretend the server has been up for a
        // long time; the third belongs to a server that just rebooted
        let server = fake_server(|req, count| {
            let epoch = if count <= 2 { 500_000 } else { 100 };
            Some(grant(req, 600, epoch))
        })
        .await;
        let gateway = spawn(server.addr, None).await.unwrap();

        gateway
            .map(5000, localhost(), MapOptions::default())
            .await
            .unwrap();
        gateway
            .map(5001, localhost(), MapOptions::default())
            .await
            .unwrap();
        // this response's projected epoch deviates by far more than the
        // tolerated drift
        gateway
            .map(5002, localhost(), MapOptions::default())
            .await
            .unwrap();

        // the gateway now re-requests all three mappings on its own
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let count = server.requests.lock().unwrap().len();
            if count >= 6 {
                break;
            }
            assert!(Instant::now() < deadline, "remap never happened");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let sent = server.requests.lock().unwrap();
        let original: Vec<_> = sent[..3].iter().map(|r| r.nonce).collect();
        for remap in &sent[3..6] {
            assert!(original.contains(&remap.nonce), "remap reused the nonces");
        }
    }

    #[tokio::test]
    async fn external_ip_uses_a_short_lived_probe_mapping() {
        let server = fake_server(|req, _| Some(grant(req, 120, 1000))).await;
        let gateway = spawn(server.addr, None).await.unwrap();

        let ip = gateway
            .external_ip_via(vec![localhost()], &MapOptions::default())
            .await
            .unwrap();
        assert_eq!(ip, "1.2.3.4".parse::<IpAddr>().unwrap());

        let sent = server.requests.lock().unwrap();
        assert_eq!(sent[0].lifetime, 120);
        assert!((49152..=65535).contains(&sent[0].internal_port));
        // the probe mapping is released afterwards
        assert_eq!(sent[1].lifetime, 0);
        assert_eq!(sent[1].internal_port, sent[0].internal_port);
    }

    #[tokio::test]
    async fn gateway_errors_surface_with_their_code_and_message() {
        let server = fake_server(|req, _| {
            Some(encode_response(
                OpCode::Map,
                ResultCode::NotAuthorized,
                0,
                1000,
                Some(&MapResponse {
                    nonce: req.nonce,
                    protocol: req.protocol,
                    internal_port: req.internal_port,
                    external_port: 0,
                    external_addr: Ipv6Addr::UNSPECIFIED,
                }),
            ))
        })
        .await;
        let gateway = spawn(server.addr, None).await.unwrap();

        let err = gateway
            .map(5000, localhost(), MapOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::Gateway { code, message } => {
                assert_eq!(code, 2);
                assert_eq!(message, "not authorized");
            }
            other => panic!("unexpected error: {other}"),
        }
        // the failed row is gone so a retry starts from scratch
        assert!(gateway.mappings().await.is_empty());
    }

    #[tokio::test]
    async fn unanswered_requests_time_out_and_drop_their_row() {
        let server = fake_server(|_, _| None).await;
        let gateway = spawn(server.addr, None).await.unwrap();

        let err = gateway
            .map(
                5000,
                localhost(),
                MapOptions {
                    refresh_timeout: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(gateway.mappings().await.is_empty());
    }

    #[tokio::test]
    async fn stop_releases_mappings_and_closes_the_gateway() {
        let server = fake_server(|req, _| Some(grant(req, 600, 1000))).await;
        let gateway = spawn(server.addr, None).await.unwrap();

        gateway
            .map(5000, localhost(), MapOptions::default())
            .await
            .unwrap();
        gateway.stop(StopOptions::default()).await.unwrap();

        let sent = server.requests.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].lifetime, 0);
        drop(sent);

        let err = gateway
            .map(5001, localhost(), MapOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn aborting_a_map_deletes_the_pending_row() {
        let server = fake_server(|_, _| None).await;
        let gateway = spawn(server.addr, None).await.unwrap();

        let signal = tokio_util::sync::CancellationToken::new();
        let cancel = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = gateway
            .map(
                5000,
                localhost(),
                MapOptions {
                    signal: Some(signal),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));

        // give the cancel command time to reach the task
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(gateway.mappings().await.is_empty());
    }

    #[test]
    fn epoch_projection_tolerates_drift_but_not_reboots() {
        let mut tracker = EpochTracker { known: None };
        let now = 1_000_000u64;

        // first observation is taken as-is
        assert!(!tracker.observe(5000, now));
        // same projection a minute later
        assert!(!tracker.observe(5060, now + 60));
        // five seconds of drift stays within tolerance
        assert!(!tracker.observe(5055, now + 60));
        // a sixty second deviation means the server rebooted
        assert!(tracker.observe(5000, now + 60));
    }

    #[test]
    fn epoch_going_backwards_means_a_reboot() {
        let mut tracker = EpochTracker { known: None };
        let now = 1_000_000u64;
        assert!(!tracker.observe(5000, now));
        // projected epoch moves earlier than the known one
        assert!(tracker.observe(5100, now + 60));
    }
}
