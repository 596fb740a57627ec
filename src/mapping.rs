//! The in-memory table of mappings a gateway is responsible for.
//!
//! Every mapping a gateway has been asked to create gets one row, keyed by
//! the (internal host, internal port, protocol) triple with the protocol
//! compared case-insensitively. Rows are created at send time, gain their
//! external fields when a matching response arrives, and are removed on
//! unmap, on request failure, or when the gateway closes.
//!
//! Each row carries a 12-byte random nonce. PCP requires the same nonce to
//! be sent on every refresh to retarget the mapping, so the nonce is
//! assigned once and never changes for the lifetime of the row.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// Random value that ties a mapping request to its refreshes
pub type Nonce = [u8; 12];

/// Current wall-clock time in milliseconds since the Unix epoch
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current wall-clock time in seconds since the Unix epoch
pub(crate) fn unix_s() -> u64 {
    unix_ms() / 1000
}

/// One port mapping as tracked by a gateway
#[derive(Clone, Debug)]
pub struct Mapping {
    /// Protocol as originally spelled by the caller
    pub protocol: String,
    pub internal_host: IpAddr,
    pub internal_port: u16,
    /// Externally visible address, once the gateway has assigned one
    pub external_host: Option<IpAddr>,
    /// Externally visible port, once the gateway has assigned one
    pub external_port: Option<u16>,
    /// Assigned once at creation, identical across refreshes
    pub nonce: Nonce,
    /// Whether the owning gateway renews this mapping before expiry
    pub auto_refresh: bool,
    /// Expiry instant in Unix milliseconds, from the granted lifetime
    pub expires_at: Option<u64>,
    /// Lifetime in seconds as negotiated with the gateway
    pub lifetime: Option<u32>,
}

impl Mapping {
    fn matches(&self, host: IpAddr, port: u16, protocol: &str) -> bool {
        self.internal_host == host
            && self.internal_port == port
            && self.protocol.eq_ignore_ascii_case(protocol)
    }
}

/// The set of mappings owned by one gateway
#[derive(Default)]
pub struct MappingTable {
    rows: Vec<Mapping>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: IpAddr, port: u16, protocol: &str) -> Option<&Mapping> {
        self.rows.iter().find(|m| m.matches(host, port, protocol))
    }

    pub fn get_by_nonce(&self, nonce: &Nonce) -> Option<&Mapping> {
        self.rows.iter().find(|m| &m.nonce == nonce)
    }

    /// Returns the row for the triple, creating it with a fresh random
    /// nonce when none exists yet
    pub fn get_or_create(
        &mut self,
        host: IpAddr,
        port: u16,
        protocol: &str,
        auto_refresh: bool,
    ) -> &Mapping {
        // Indexing instead of returning from the find keeps the borrow
        // checker happy across the insertion path
        if let Some(i) = self.rows.iter().position(|m| m.matches(host, port, protocol)) {
            return &self.rows[i];
        }
        self.rows.push(Mapping {
            protocol: protocol.to_string(),
            internal_host: host,
            internal_port: port,
            external_host: None,
            external_port: None,
            nonce: self.fresh_nonce(),
            auto_refresh,
            expires_at: None,
            lifetime: None,
        });
        self.rows.last().expect("row was just pushed")
    }

    fn fresh_nonce(&self) -> Nonce {
        let mut rng = rand::thread_rng();
        loop {
            let mut nonce = Nonce::default();
            rng.fill_bytes(&mut nonce);
            if self.get_by_nonce(&nonce).is_none() {
                return nonce;
            }
        }
    }

    /// Writes the external fields on every row matching the
    /// (internal port, case-folded protocol, nonce) triple.
    ///
    /// Returns whether at least one row matched. Responses are keyed by
    /// nonce; the port and protocol checks guard against a gateway echoing
    /// a nonce on the wrong mapping.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        internal_port: u16,
        protocol: &str,
        nonce: &Nonce,
        external_host: IpAddr,
        external_port: u16,
        expires_at: u64,
        lifetime: u32,
    ) -> bool {
        let mut updated = false;
        for row in self.rows.iter_mut().filter(|m| {
            m.internal_port == internal_port
                && m.protocol.eq_ignore_ascii_case(protocol)
                && &m.nonce == nonce
        }) {
            row.external_host = Some(external_host);
            row.external_port = Some(external_port);
            row.expires_at = Some(expires_at);
            row.lifetime = Some(lifetime);
            updated = true;
        }
        updated
    }

    pub fn delete(&mut self, host: IpAddr, port: u16, protocol: &str) -> Option<Mapping> {
        let i = self.rows.iter().position(|m| m.matches(host, port, protocol))?;
        Some(self.rows.remove(i))
    }

    pub fn delete_by_nonce(&mut self, nonce: &Nonce) -> Option<Mapping> {
        let i = self.rows.iter().position(|m| &m.nonce == nonce)?;
        Some(self.rows.remove(i))
    }

    pub fn delete_all(&mut self) -> Vec<Mapping> {
        std::mem::take(&mut self.rows)
    }

    /// Rows due for renewal: auto-refreshing, with known expiry, and with
    /// less than half of their lifetime remaining (RFC 6887 §11.2.1)
    pub fn expiring(&self, now_ms: u64) -> impl Iterator<Item = &Mapping> {
        self.rows.iter().filter(move |m| {
            m.auto_refresh
                && match (m.expires_at, m.lifetime) {
                    (Some(expires), Some(lifetime)) => {
                        expires.saturating_sub(now_ms) < u64::from(lifetime) * 500
                    }
                    _ => false,
                }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.rows.iter()
    }

    /// Copy of the current rows, for external observation
    pub fn snapshot(&self) -> Vec<Mapping> {
        self.rows.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}
