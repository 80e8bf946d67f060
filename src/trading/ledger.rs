//! Replication ledger: what has been copied, per master ticket.
//!
//! Owned and mutated by the engine task only. Readers get cloned records via
//! the engine's published view, never the live map.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::models::Ticket;

/// Lifecycle of a master ticket. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReplicationStatus {
    New,
    Copied,
    Closed,
}

impl ReplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationStatus::New => "new",
            ReplicationStatus::Copied => "copied",
            ReplicationStatus::Closed => "closed",
        }
    }
}

/// One row per master ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRecord {
    pub master_ticket: Ticket,
    pub status: ReplicationStatus,
    /// Slave login -> slave-side order/position ticket
    pub mirrors: BTreeMap<u64, Ticket>,
    /// Slaves that sat this trade out by policy and are never retried
    pub skipped: BTreeSet<u64>,
}

impl ReplicationRecord {
    fn new(master_ticket: Ticket, status: ReplicationStatus) -> Self {
        Self {
            master_ticket,
            status,
            mirrors: BTreeMap::new(),
            skipped: BTreeSet::new(),
        }
    }

    /// Slave has a mirror or was skipped; nothing left to do for it.
    pub fn is_settled_for(&self, slave: u64) -> bool {
        self.mirrors.contains_key(&slave) || self.skipped.contains(&slave)
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    records: HashMap<Ticket, ReplicationRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, ticket: Ticket) -> Option<ReplicationStatus> {
        self.records.get(&ticket).map(|r| r.status)
    }

    pub fn record(&self, ticket: Ticket) -> Option<&ReplicationRecord> {
        self.records.get(&ticket)
    }

    /// Create the record if missing, otherwise advance its status.
    ///
    /// Returns `false` (and changes nothing) for a backwards transition.
    pub fn set_status(&mut self, ticket: Ticket, status: ReplicationStatus) -> bool {
        let record = self
            .records
            .entry(ticket)
            .or_insert_with(|| ReplicationRecord::new(ticket, status));

        if status < record.status {
            debug!(ticket = %ticket, from = record.status.as_str(), to = status.as_str(), "Ignoring status regression");
            return false;
        }
        record.status = status;
        true
    }

    /// Record a slave's mirror. An existing mapping is never overwritten.
    pub fn record_slave_order(&mut self, ticket: Ticket, slave: u64, slave_ticket: Ticket) -> bool {
        let Some(record) = self.records.get_mut(&ticket) else {
            return false;
        };
        if record.mirrors.contains_key(&slave) {
            return false;
        }
        record.mirrors.insert(slave, slave_ticket);
        true
    }

    #[cfg(test)]
    pub fn slave_order_for(&self, ticket: Ticket, slave: u64) -> Option<Ticket> {
        self.records.get(&ticket).and_then(|r| r.mirrors.get(&slave).copied())
    }

    /// Drop a mirror once the slave position is confirmed gone.
    pub fn remove_slave_order(&mut self, ticket: Ticket, slave: u64) -> Option<Ticket> {
        self.records.get_mut(&ticket).and_then(|r| r.mirrors.remove(&slave))
    }

    pub fn mark_skipped(&mut self, ticket: Ticket, slave: u64) {
        if let Some(record) = self.records.get_mut(&ticket) {
            record.skipped.insert(slave);
        }
    }

    /// Clear every slave mapping (after a flatten). Returns how many were dropped.
    pub fn clear_slave_orders(&mut self) -> usize {
        self.records
            .values_mut()
            .map(|r| {
                let n = r.mirrors.len();
                r.mirrors.clear();
                n
            })
            .sum()
    }

    pub fn forget(&mut self, ticket: Ticket) -> Option<ReplicationRecord> {
        self.records.remove(&ticket)
    }

    pub fn all_tracked(&self) -> BTreeSet<Ticket> {
        self.records.keys().copied().collect()
    }

    /// Closed tickets that still have slave mirrors to take down.
    pub fn closed_with_mirrors(&self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self
            .records
            .values()
            .filter(|r| r.status == ReplicationStatus::Closed && !r.mirrors.is_empty())
            .map(|r| r.master_ticket)
            .collect();
        tickets.sort();
        tickets
    }

    /// Closed tickets whose mirrors are all gone.
    pub fn settled_closed(&self) -> Vec<Ticket> {
        self.records
            .values()
            .filter(|r| r.status == ReplicationStatus::Closed && r.mirrors.is_empty())
            .map(|r| r.master_ticket)
            .collect()
    }

    /// Seed a record for a mirror that existed before this process started.
    pub fn restore_mirror(&mut self, ticket: Ticket, slave: u64, slave_ticket: Ticket) {
        self.set_status(ticket, ReplicationStatus::Copied);
        self.record_slave_order(ticket, slave, slave_ticket);
    }

    /// Consistent copy of every record, ordered by master ticket.
    pub fn snapshot(&self) -> Vec<ReplicationRecord> {
        let mut records: Vec<ReplicationRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|r| r.master_ticket);
        records
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
