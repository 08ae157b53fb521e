//! Pooled entry: one authenticated connection per backend node,
//! all sharing a single startup packet.

use tokio::time::Instant;

use crate::net::messages::{BackendKeyData, ParameterStatus, StartupPacket};

use super::super::{Error, Server};

/// Per-entry transaction state, cached across reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Idle,
    InBlock,
    FailedBlock,
}

impl TransactionState {
    pub fn from_char(status: char) -> Self {
        match status {
            'T' => TransactionState::InBlock,
            'E' => TransactionState::FailedBlock,
            _ => TransactionState::Idle,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            TransactionState::Idle => 'I',
            TransactionState::InBlock => 'T',
            TransactionState::FailedBlock => 'E',
        }
    }
}

/// A set of backend connections serving one session at a time.
#[derive(Debug)]
pub struct PoolEntry {
    /// The startup packet all slots were created with. Its canonical
    /// bytes are the pool key.
    pub startup: StartupPacket,
    /// Key data handed to the client; cancel requests route on it.
    pub key: BackendKeyData,
    /// Slots indexed by backend node id.
    slots: Vec<Option<Server>>,
    /// None while a session is using the entry; otherwise when it
    /// went idle.
    pub closetime: Option<Instant>,
    pub tstate: TransactionState,
}

impl PoolEntry {
    pub fn new(startup: StartupPacket, slots: Vec<Option<Server>>) -> Self {
        Self {
            startup,
            key: BackendKeyData::new_client(),
            slots,
            closetime: None,
            tstate: TransactionState::Idle,
        }
    }

    /// Node ids this entry holds connections to.
    pub fn nodes(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn has_node(&self, id: usize) -> bool {
        self.slots.get(id).map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn slot(&mut self, id: usize) -> Option<&mut Server> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    /// Lowest-indexed slot; the "master" connection whose parameters
    /// are replayed on reuse.
    pub fn master(&self) -> Option<&Server> {
        self.slots.iter().flatten().next()
    }

    pub fn master_mut(&mut self) -> Option<&mut Server> {
        self.slots.iter_mut().flatten().next()
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut Server> {
        self.slots.iter_mut().flatten()
    }

    /// Cached ParameterStatus set from the master slot.
    pub fn params(&self) -> Vec<ParameterStatus> {
        self.master()
            .map(|server| server.params().to_vec())
            .unwrap_or_default()
    }

    /// Probe every slot. A silently-dead one poisons the whole entry.
    pub async fn check_sockets(&mut self) -> bool {
        for server in self.slots_mut() {
            if server.check().await.is_err() {
                return false;
            }
        }
        true
    }

    /// Run reset statements on every slot.
    pub async fn reset(&mut self, statements: &[String]) -> Result<(), Error> {
        for server in self.slots_mut() {
            server.reset(statements).await?;
        }
        self.tstate = TransactionState::Idle;
        Ok(())
    }

    /// Gracefully close every slot.
    pub async fn terminate(mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(server) = slot.take() {
                server.terminate().await;
            }
        }
    }

    /// Age of an idle entry.
    pub fn idle_since(&self) -> Option<Instant> {
        self.closetime
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_transaction_state() {
        assert_eq!(TransactionState::from_char('I'), TransactionState::Idle);
        assert_eq!(TransactionState::from_char('T'), TransactionState::InBlock);
        assert_eq!(
            TransactionState::from_char('E'),
            TransactionState::FailedBlock
        );
        assert_eq!(TransactionState::InBlock.as_char(), 'T');
    }

    #[test]
    fn test_empty_entry() {
        let startup = StartupPacket::new_v3(vec![("user".into(), "alice".into())]);
        let entry = PoolEntry::new(startup, vec![None, None]);

        assert!(entry.nodes().is_empty());
        assert!(entry.master().is_none());
        assert!(entry.params().is_empty());
    }
}
