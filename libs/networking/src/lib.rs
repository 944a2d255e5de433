//! Networking utilities for the multiplexer.
//!
//! This library provides helpers for:
//! - Port range management for per-cluster listeners
//! - Sequential port allocation (no reuse within a process lifetime)
//! - Formatting listener addresses the way the registry keys them

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

/// Default lower bound of the listener port range.
pub const DEFAULT_MIN_PORT: u16 = 20000;

/// Default upper bound (inclusive) of the listener port range.
///
/// Allows for ~4k simulated clusters.
pub const DEFAULT_MAX_PORT: u16 = 24000;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid port range.
    #[error("invalid port range: {0}")]
    InvalidRange(String),

    /// Port pool exhausted.
    #[error("no more free ports in the {0} range")]
    PoolExhausted(PortRange),
}

// ============================================================================
// Port ranges
// ============================================================================

/// Inclusive range of TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// First port of the range.
    pub min: u16,

    /// Last port of the range (inclusive).
    pub max: u16,
}

impl PortRange {
    /// Create a new range.
    pub fn new(min: u16, max: u16) -> Result<Self, NetworkError> {
        if min == 0 {
            return Err(NetworkError::InvalidRange(
                "port 0 cannot be part of a listener range".to_string(),
            ));
        }
        if min > max {
            return Err(NetworkError::InvalidRange(format!(
                "min port {} is greater than max port {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Parse from "min-max" notation (e.g., "20000-24000").
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let Some((min, max)) = s.split_once('-') else {
            return Err(NetworkError::InvalidRange(format!(
                "missing '-' in port range: {}",
                s
            )));
        };

        let min: u16 = min
            .trim()
            .parse()
            .map_err(|_| NetworkError::InvalidRange(format!("invalid min port: {}", min)))?;
        let max: u16 = max
            .trim()
            .parse()
            .map_err(|_| NetworkError::InvalidRange(format!("invalid max port: {}", max)))?;

        Self::new(min, max)
    }

    /// Check if a port is within the range.
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    /// Number of ports in the range.
    pub fn size(&self) -> u32 {
        u32::from(self.max) - u32::from(self.min) + 1
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_PORT,
            max: DEFAULT_MAX_PORT,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Sequential port allocator.
///
/// Ports are handed out in increasing order and never reused; once the
/// cursor moves past the end of the range every call fails.
#[derive(Debug)]
pub struct PortAllocator {
    /// Range to allocate from.
    range: PortRange,

    /// Next port to hand out. Wider than u16 so it can move past 65535.
    next: u32,
}

impl PortAllocator {
    /// Create a new allocator for a range.
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            next: u32::from(range.min),
        }
    }

    /// Allocate the next available port.
    pub fn allocate(&mut self) -> Result<u16, NetworkError> {
        if self.next > u32::from(self.range.max) {
            return Err(NetworkError::PoolExhausted(self.range));
        }

        // TODO: probe that the port is actually free and skip it otherwise.
        let port = self.next as u16;
        self.next += 1;

        Ok(port)
    }

    /// Move the cursor past a port that was handed out elsewhere (recovery).
    ///
    /// Never moves the cursor backwards.
    pub fn reserve_through(&mut self, port: u16) {
        self.next = self.next.max(u32::from(port) + 1);
    }

    /// Peek at the port the next successful `allocate` would return.
    pub fn next_port(&self) -> Option<u16> {
        if self.next > u32::from(self.range.max) {
            None
        } else {
            Some(self.next as u16)
        }
    }

    /// Get the range being allocated from.
    pub fn range(&self) -> &PortRange {
        &self.range
    }

    /// Get remaining ports.
    pub fn remaining(&self) -> u32 {
        (u32::from(self.range.max) + 1).saturating_sub(self.next)
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// Join a host and port into the `host:port` form used to key listeners.
///
/// IPv6 literals are bracketed.
pub fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}
