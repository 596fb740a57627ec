//! NAT-PMP gateway (RFC 6886).
//!
//! Same runtime shape as the PCP gateway: one task owns the socket, the
//! queue and the table, and callers hold a clonable handle. The protocol is
//! IPv4-only and has no nonces on the wire, so responses are correlated to
//! the head of the queue purely by opcode. A mapping's externally visible
//! address is not part of the MAP response; it is learned with a separate
//! EXTERNAL-IP request before the mapping is requested.
//!
//! Renewal follows the one-shot-timer policy: each confirmed mapping is
//! re-requested `refreshThreshold` before it expires, and a renewal that
//! fails for good stops the timer while leaving the row in place.

pub(crate) mod proto;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::gateway::{fan_out, Family, Gateway, PortMapping};
use crate::mapping::{unix_ms, unix_s, Mapping, MappingTable, Nonce};
use crate::options::{MapOptions, PmpNatOptions, Protocol, StopOptions};
use crate::queue::{Pending, RequestQueue};

use proto::{OpCode, Response, ResponseBody, ResultCode};

/// Deadline for gateway-internal requests (refreshes, releases)
const INTERNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates a NAT-PMP gateway for the NAT device at `gateway`
pub async fn pmp_nat(gateway: Ipv4Addr, opts: PmpNatOptions) -> Result<NatPmpGateway> {
    let server = SocketAddr::new(IpAddr::V4(gateway), proto::SERVER_PORT);
    let connect = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server).await?;
        Ok::<_, Error>(socket)
    };
    let socket = match opts.signal {
        Some(signal) => tokio::select! {
            _ = signal.cancelled() => return Err(Error::Aborted),
            result = connect => result?,
        },
        None => connect.await?,
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let runner = Runner {
        socket,
        cmd_rx,
        table: MappingTable::new(),
        queue: RequestQueue::new(),
        thresholds: HashMap::new(),
        jobs: HashMap::new(),
        next_job: 0,
        closing: false,
        cmd_closed: false,
    };
    tokio::spawn(runner.run());

    Ok(NatPmpGateway { cmd: cmd_tx })
}

#[cfg(test)]
pub(crate) async fn spawn(server: SocketAddr) -> Result<NatPmpGateway> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.connect(server).await?;
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let runner = Runner {
        socket,
        cmd_rx,
        table: MappingTable::new(),
        queue: RequestQueue::new(),
        thresholds: HashMap::new(),
        jobs: HashMap::new(),
        next_job: 0,
        closing: false,
        cmd_closed: false,
    };
    tokio::spawn(runner.run());
    Ok(NatPmpGateway { cmd: cmd_tx })
}

/// Handle to a running NAT-PMP gateway task
#[derive(Clone)]
pub struct NatPmpGateway {
    cmd: mpsc::Sender<Cmd>,
}

/// Reply payload shared by the two request kinds
enum Outcome {
    Mapped {
        external_port: u16,
    },
    Address(Ipv4Addr),
}

impl NatPmpGateway {
    async fn send_cmd(&self, cmd: Cmd) -> Result<()> {
        self.cmd.send(cmd).await.map_err(|_| Error::Closed)
    }

    async fn await_reply<T>(
        rx: oneshot::Receiver<Result<T>>,
        signal: Option<&tokio_util::sync::CancellationToken>,
    ) -> Result<T> {
        match signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => Err(Error::Aborted),
                result = rx => result.unwrap_or(Err(Error::Closed)),
            },
            None => rx.await.unwrap_or(Err(Error::Closed)),
        }
    }

    async fn request_external_address(&self, opts: &MapOptions) -> Result<Ipv4Addr> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Cmd::ExternalAddress {
            timeout: opts.refresh_timeout(),
            reply,
        })
        .await?;
        match Self::await_reply(rx, opts.signal.as_ref()).await? {
            Outcome::Address(addr) => Ok(addr),
            Outcome::Mapped { .. } => Err(Error::UnknownMapping),
        }
    }
}

#[async_trait::async_trait]
impl Gateway for NatPmpGateway {
    async fn map(
        &self,
        internal_port: u16,
        internal_host: IpAddr,
        opts: MapOptions,
    ) -> Result<PortMapping> {
        let IpAddr::V4(host) = internal_host else {
            return Err(Error::UnsupportedFamily);
        };
        let (protocol_raw, protocol) = opts.protocol()?;
        // RFC 6886 recommends two hours when the caller's budget does not
        // translate into a usable number of seconds
        let lifetime = match (opts.ttl_ms() / 1000) as u32 {
            0 => proto::DEFAULT_LIFETIME,
            s => s,
        };

        // The MAP response carries no address, so learn it first
        let external_host = self.request_external_address(&opts).await?;

        let (reply, rx) = oneshot::channel();
        self.send_cmd(Cmd::Map {
            params: MapParams {
                host,
                port: internal_port,
                protocol_raw: protocol_raw.clone(),
                protocol,
                lifetime,
                external_port: opts.external_port,
                external_host,
                auto_refresh: opts.auto_refresh(),
                refresh_threshold: opts.refresh_threshold_ms(),
                timeout: opts.refresh_timeout(),
            },
            reply,
        })
        .await?;

        let outcome = match &opts.signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => {
                    self.send_cmd(Cmd::Cancel {
                        host,
                        port: internal_port,
                        protocol: protocol_raw.clone(),
                    })
                    .await
                    .ok();
                    return Err(Error::Aborted);
                }
                result = rx => result.unwrap_or(Err(Error::Closed))?,
            },
            None => rx.await.unwrap_or(Err(Error::Closed))?,
        };
        match outcome {
            Outcome::Mapped { external_port } => Ok(PortMapping {
                protocol: protocol_raw.to_uppercase(),
                internal_host,
                internal_port,
                external_host: IpAddr::V4(external_host),
                external_port,
            }),
            Outcome::Address(_) => Err(Error::UnknownMapping),
        }
    }

    async fn map_all(
        &self,
        internal_port: u16,
        opts: MapOptions,
    ) -> futures::stream::BoxStream<'static, Result<PortMapping>> {
        fan_out(self.clone(), Family::V4, internal_port, opts)
    }

    async fn unmap(&self, internal_port: u16, opts: MapOptions) -> Result<()> {
        let (protocol_raw, _) = opts.protocol()?;
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Cmd::Unmap {
            port: internal_port,
            protocol: protocol_raw,
            timeout: opts.refresh_timeout(),
            reply,
        })
        .await?;
        Self::await_reply(rx, opts.signal.as_ref()).await
    }

    async fn external_ip(&self, opts: MapOptions) -> Result<IpAddr> {
        self.request_external_address(&opts)
            .await
            .map(IpAddr::V4)
    }

    async fn stop(&self, opts: StopOptions) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(Cmd::Stop { reply }).await?;
        Self::await_reply(rx, opts.signal.as_ref()).await
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
    host: Ipv4Addr,
    port: u16,
    protocol_raw: String,
    protocol: Protocol,
    lifetime: u32,
    external_port: Option<u16>,
    external_host: Ipv4Addr,
    auto_refresh: bool,
    refresh_threshold: u64,
    timeout: Duration,
}

enum Cmd {
    Map {
        params: MapParams,
        reply: oneshot::Sender<Result<Outcome>>,
    },
    ExternalAddress {
        timeout: Duration,
        reply: oneshot::Sender<Result<Outcome>>,
    },
    Unmap {
        port: u16,
        protocol: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        host: Ipv4Addr,
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

enum Ctx {
    Map {
        protocol: String,
        external_host: Ipv4Addr,
        auto_refresh: bool,
        refresh_threshold: u64,
    },
    ExternalAddress,
    Refresh,
    Release { job: u64 },
}

struct Job {
    remaining: usize,
    error: Option<Error>,
    reply: Option<oneshot::Sender<Result<()>>>,
    stop: bool,
}

struct Runner {
    socket: UdpSocket,
    cmd_rx: mpsc::Receiver<Cmd>,
    table: MappingTable,
    queue: RequestQueue<Outcome, Ctx>,
    /// Effective refresh margin per confirmed mapping, in milliseconds.
    /// Removing an entry stops that mapping's renewal timer.
    thresholds: HashMap<Nonce, u64>,
    jobs: HashMap<u64, Job>,
    next_job: u64,
    closing: bool,
    cmd_closed: bool,
}

impl Runner {
    async fn run(mut self) {
        let mut buf = [0u8; 64];
        loop {
            self.pump().await;
            let deadline = self.queue.deadline();
            let renewal = self.next_refresh();
            let done = tokio::select! {
                cmd = self.cmd_rx.recv(), if !self.cmd_closed => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
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
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.timeout_head()
                }
                _ = sleep_until(renewal.unwrap_or_else(Instant::now)), if renewal.is_some() => {
                    self.refresh_due();
                    false
                }
            };
            if done {
                break;
            }
        }
    }

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
                    IpAddr::V4(params.host),
                    params.port,
                    &params.protocol_raw,
                    params.auto_refresh,
                );
                let nonce = row.nonce;
                let external_port = params
                    .external_port
                    .or(row.external_port)
                    .unwrap_or(params.port);
                let packet =
                    proto::encode_map(params.protocol, params.port, external_port, params.lifetime);
                self.queue.push(Pending::new(
                    OpCode::map(params.protocol) as u8,
                    packet,
                    Some(reply),
                    Some(nonce),
                    params.timeout,
                    Ctx::Map {
                        protocol: params.protocol_raw,
                        external_host: params.external_host,
                        auto_refresh: params.auto_refresh,
                        refresh_threshold: params.refresh_threshold,
                    },
                ));
                false
            }
            Cmd::ExternalAddress { timeout, reply } => {
                if self.closing {
                    reply.send(Err(Error::Closed)).ok();
                    return false;
                }
                self.queue.push(Pending::new(
                    OpCode::ExternalAddress as u8,
                    proto::encode_external_address(),
                    Some(reply),
                    None,
                    timeout,
                    Ctx::ExternalAddress,
                ));
                false
            }
            Cmd::Unmap {
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
                        m.internal_port == port && m.protocol.eq_ignore_ascii_case(&protocol)
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
                if let Some(nonce) = self
                    .table
                    .get(IpAddr::V4(host), port, &protocol)
                    .map(|m| m.nonce)
                {
                    if let Some(pending) = self.queue.cancel(&nonce) {
                        pending.resolve(Err(Error::Aborted));
                    }
                    self.table.delete_by_nonce(&nonce);
                    self.thresholds.remove(&nonce);
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
        if !self.queue.in_flight() {
            debug!("dropping response with no request in flight");
            return false;
        }
        if !self.queue.head_matches(resp.opcode as u8) {
            warn!(opcode = resp.opcode as u8, "ignoring stale response");
            return false;
        }
        match self.queue.complete() {
            Some(pending) => self.process_response(pending, resp),
            None => false,
        }
    }

    fn process_response(&mut self, pending: Pending<Outcome, Ctx>, resp: Response) -> bool {
        if resp.result != ResultCode::Success {
            let error = Error::Gateway {
                code: resp.result as u16,
                message: resp.result.message().to_string(),
            };
            return self.fail_pending(pending, error);
        }
        match pending.ctx {
            Ctx::ExternalAddress => match resp.body {
                ResponseBody::ExternalAddress(addr) => {
                    pending.resolve(Ok(Outcome::Address(addr)));
                    false
                }
                // opcode matched but the body did not; treat like a
                // transport fault for this request
                _ => self.fail_pending(pending, Error::UnknownMapping),
            },
            Ctx::Map {
                ref protocol,
                external_host,
                auto_refresh,
                refresh_threshold,
            } => {
                let ResponseBody::Map {
                    internal_port,
                    external_port,
                    lifetime,
                } = resp.body
                else {
                    return self.fail_pending(pending, Error::UnknownMapping);
                };
                let confirmed = pending.nonce.is_some_and(|nonce| {
                    let expires_at = (unix_s() + u64::from(lifetime)) * 1000;
                    self.table.update(
                        internal_port,
                        protocol,
                        &nonce,
                        IpAddr::V4(external_host),
                        external_port,
                        expires_at,
                        lifetime,
                    )
                });
                if confirmed {
                    if auto_refresh {
                        if let Some(nonce) = pending.nonce {
                            // Never renew later than the half-life point
                            let margin = refresh_threshold.min(u64::from(lifetime) * 500);
                            self.thresholds.insert(nonce, margin);
                        }
                    }
                    pending.resolve(Ok(Outcome::Mapped { external_port }));
                } else {
                    if let Some(nonce) = pending.nonce {
                        self.table.delete_by_nonce(&nonce);
                    }
                    pending.resolve(Err(Error::UnknownMapping));
                }
                false
            }
            Ctx::Refresh => {
                let ResponseBody::Map {
                    internal_port,
                    external_port,
                    lifetime,
                } = resp.body
                else {
                    warn!("refresh response carried the wrong body");
                    return false;
                };
                let updated = pending.nonce.is_some_and(|nonce| {
                    let (protocol, external_host) = match self.table.get_by_nonce(&nonce) {
                        Some(row) => (
                            row.protocol.clone(),
                            row.external_host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                        ),
                        None => return false,
                    };
                    let expires_at = (unix_s() + u64::from(lifetime)) * 1000;
                    self.table.update(
                        internal_port,
                        &protocol,
                        &nonce,
                        external_host,
                        external_port,
                        expires_at,
                        lifetime,
                    )
                });
                if updated {
                    debug!(port = internal_port, "mapping refreshed");
                } else {
                    warn!("refresh response did not match any mapping");
                }
                false
            }
            Ctx::Release { job } => {
                if let Some(nonce) = pending.nonce {
                    self.table.delete_by_nonce(&nonce);
                    self.thresholds.remove(&nonce);
                }
                self.finish_release(job, None)
            }
        }
    }

    fn fail_pending(&mut self, pending: Pending<Outcome, Ctx>, error: Error) -> bool {
        match pending.ctx {
            Ctx::Map { .. } => {
                if let Some(nonce) = pending.nonce {
                    self.table.delete_by_nonce(&nonce);
                    self.thresholds.remove(&nonce);
                }
                pending.resolve(Err(error));
                false
            }
            Ctx::ExternalAddress => {
                pending.resolve(Err(error));
                false
            }
            Ctx::Refresh => {
                // The mapping stays in the table; only its timer stops
                if let Some(nonce) = pending.nonce {
                    self.thresholds.remove(&nonce);
                }
                warn!("mapping refresh failed: {error}");
                false
            }
            Ctx::Release { job } => {
                if let Some(nonce) = pending.nonce {
                    self.table.delete_by_nonce(&nonce);
                    self.thresholds.remove(&nonce);
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

    /// Deleting a NAT-PMP mapping is a MAP with zero lifetime and a zero
    /// suggested external port
    fn enqueue_release(&mut self, row: &Mapping, timeout: Duration, job: u64) {
        let protocol = Protocol::parse(&row.protocol).unwrap_or(Protocol::Tcp);
        let packet = proto::encode_map(protocol, row.internal_port, 0, 0);
        self.queue.push(Pending::new(
            OpCode::map(protocol) as u8,
            packet,
            None,
            Some(row.nonce),
            timeout,
            Ctx::Release { job },
        ));
    }

    /// Instant of the earliest pending renewal, if any mapping has a
    /// running timer
    fn next_refresh(&self) -> Option<Instant> {
        if self.closing {
            return None;
        }
        let now = unix_ms();
        self.table
            .iter()
            .filter(|row| row.auto_refresh && !self.queue.contains(&row.nonce))
            .filter_map(|row| {
                let expires = row.expires_at?;
                let margin = *self.thresholds.get(&row.nonce)?;
                Some(expires.saturating_sub(margin))
            })
            .min()
            .map(|at| Instant::now() + Duration::from_millis(at.saturating_sub(now)))
    }

    fn refresh_due(&mut self) {
        let now = unix_ms();
        let due: Vec<Mapping> = self
            .table
            .iter()
            .filter(|row| {
                row.auto_refresh
                    && !self.queue.contains(&row.nonce)
                    && match (row.expires_at, self.thresholds.get(&row.nonce)) {
                        (Some(expires), Some(margin)) => expires.saturating_sub(*margin) <= now,
                        _ => false,
                    }
            })
            .cloned()
            .collect();
        for row in due {
            let protocol = Protocol::parse(&row.protocol).unwrap_or(Protocol::Tcp);
            let lifetime = row.lifetime.unwrap_or(proto::DEFAULT_LIFETIME);
            let packet = proto::encode_map(
                protocol,
                row.internal_port,
                row.external_port.unwrap_or(row.internal_port),
                lifetime,
            );
            self.queue.push(Pending::new(
                OpCode::map(protocol) as u8,
                packet,
                None,
                Some(row.nonce),
                INTERNAL_TIMEOUT,
                Ctx::Refresh,
            ));
        }
    }

    fn timeout_head(&mut self) -> bool {
        match self.queue.complete() {
            Some(pending) => self.fail_pending(pending, Error::Timeout),
            None => false,
        }
    }

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
