//! Port mapping table used by the NAT for one transport protocol

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    ops::RangeInclusive,
};

use super::NatError;

/// One external port slot
#[derive(Debug, Clone, Copy)]
pub struct NatTablePort {
    /// Internal address owning this port
    pub source_ip: Ipv4Addr,

    /// Internal port owning this port
    pub source_port: u16,

    /// True if the slot is currently allocated
    pub active: bool,

    /// Tick of the last packet that used this slot
    pub last_access: u64,
}

impl Default for NatTablePort {
    fn default() -> Self {
        Self {
            source_ip: Ipv4Addr::UNSPECIFIED,
            source_port: 0,
            active: false,
            last_access: 0,
        }
    }
}

/// Bidirectional mapping between internal (address, port) pairs and a fixed
/// range of external ports
///
/// Slots are handed out by a rotating cursor. When every slot is taken the
/// least recently used half is reclaimed.
#[derive(Debug, Default)]
pub struct NatTableMapping {
    /// one slot per external port, `ports[i]` describes `port_begin + i`
    ports: Box<[NatTablePort]>,

    /// (internal ip, internal port) => external port
    index: HashMap<(Ipv4Addr, u16), u16>,

    port_begin: u16,
    port_end: u16,

    /// next slot to consider for allocation
    cursor: usize,
}

impl NatTableMapping {
    /// Creates an empty, uninitialized mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates one slot per port in `port_begin..=port_end`
    ///
    /// Calling this on an already initialized mapping keeps the current state.
    ///
    /// ### Arguments
    /// * `port_begin` - First external port (inclusive)
    /// * `port_end` - Last external port (inclusive)
    pub fn initialize(&mut self, port_begin: u16, port_end: u16) -> Result<(), NatError> {
        if self.is_initialized() {
            return Ok(());
        }

        if port_end < port_begin {
            return Err(NatError::InvalidParam(format!(
                "port range {port_begin}-{port_end} is empty"
            )));
        }

        let n = usize::from(port_end - port_begin) + 1;
        self.ports = vec![NatTablePort::default(); n].into_boxed_slice();
        self.index = HashMap::new();
        self.port_begin = port_begin;
        self.port_end = port_end;
        self.cursor = 0;

        tracing::debug!(port_begin, port_end, "[nat] mapping initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        !self.ports.is_empty()
    }

    /// Number of active mappings
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of external ports managed by this table
    pub fn capacity(&self) -> usize {
        self.ports.len()
    }

    /// External port range, `None` before `initialize`
    pub fn port_range(&self) -> Option<RangeInclusive<u16>> {
        match self.is_initialized() {
            true => Some(self.port_begin..=self.port_end),
            false => None,
        }
    }

    fn port_at(&self, slot: usize) -> u16 {
        // slot < capacity <= 65536, so the sum stays within port_end
        self.port_begin + slot as u16
    }

    /// Returns the external port for an internal endpoint, allocating one if needed
    ///
    /// ### Arguments
    /// * `ip` - Internal address
    /// * `port` - Internal port
    /// * `tick` - Current time, recorded as the last access of the slot
    pub fn map_to_external(&mut self, ip: Ipv4Addr, port: u16, tick: u64) -> Result<u16, NatError> {
        if !self.is_initialized() {
            return Err(NatError::NotInitialized);
        }

        if let Some(external) = self.find_external(ip, port, tick) {
            return Ok(external);
        }

        let n = self.ports.len();
        for step in 0..(2 * n) {
            let slot = self.cursor;
            self.cursor = (self.cursor + 1) % n;

            if !self.ports[slot].active {
                self.ports[slot] = NatTablePort {
                    source_ip: ip,
                    source_port: port,
                    active: true,
                    last_access: tick,
                };

                let external = self.port_at(slot);
                self.index.insert((ip, port), external);
                tracing::trace!(%ip, port, external, "[nat] allocated port");
                return Ok(external);
            }

            if step + 1 == n {
                self.evict();
            }
        }

        Err(NatError::TableFull)
    }

    /// Releases every active slot accessed no later than the midpoint between the
    /// oldest and newest access
    fn evict(&mut self) {
        let (min, max) = self
            .ports
            .iter()
            .filter(|p| p.active)
            .fold(None, |acc: Option<(u64, u64)>, p| match acc {
                None => Some((p.last_access, p.last_access)),
                Some((min, max)) => Some((min.min(p.last_access), max.max(p.last_access))),
            })
            .unwrap_or_default();

        let mid = min + (max - min) / 2;
        let mut evicted = 0usize;
        for slot in self.ports.iter_mut() {
            if slot.active && slot.last_access <= mid {
                slot.active = false;
                self.index.remove(&(slot.source_ip, slot.source_port));
                evicted += 1;
            }
        }

        tracing::debug!(evicted, min, max, "[nat] port table full, evicted stale mappings");
    }

    /// Returns the external port of an existing mapping without allocating one
    ///
    /// ### Arguments
    /// * `ip` - Internal address
    /// * `port` - Internal port
    /// * `tick` - Current time, refreshes the mapping if found
    pub fn find_external(&mut self, ip: Ipv4Addr, port: u16, tick: u64) -> Option<u16> {
        let external = *self.index.get(&(ip, port))?;
        let slot = usize::from(external - self.port_begin);
        self.ports[slot].last_access = tick;
        Some(external)
    }

    /// Returns the internal endpoint owning an external port
    ///
    /// ### Arguments
    /// * `external` - External port
    /// * `tick` - Current time, refreshes the mapping if found
    pub fn map_to_internal(&mut self, external: u16, tick: u64) -> Option<(Ipv4Addr, u16)> {
        if !self.is_initialized() || external < self.port_begin || external > self.port_end {
            return None;
        }

        let slot = &mut self.ports[usize::from(external - self.port_begin)];
        match slot.active {
            true => {
                slot.last_access = tick;
                Some((slot.source_ip, slot.source_port))
            }
            false => None,
        }
    }
}
