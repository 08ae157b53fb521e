//! Cluster command bus.
//!
//! Every outbound command that expects replies is tracked here with
//! a fresh monotonic id. Replies route by id, never by arrival
//! order. Completion fires back into the state machine.

use std::collections::HashMap;

use super::packet::PacketType;

/// Per-recipient delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeResult {
    Init,
    Sent,
    Replied,
    SendError,
    DoNotSend,
}

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Every reachable recipient replied Accept.
    AllReplied,
    /// A peer rejected the command.
    Rejected(usize),
    /// A peer replied with an error.
    Errored(usize),
    /// The deadline passed first.
    FinishedTimeout,
}

/// One in-flight command.
#[derive(Debug, Clone)]
pub struct ClusterCommand {
    pub id: u32,
    pub ptype: PacketType,
    pub deadline: u64,
    pub results: Vec<(usize, NodeResult)>,
}

impl ClusterCommand {
    fn all_replied(&self) -> bool {
        self.results
            .iter()
            .all(|(_, result)| matches!(result, NodeResult::Replied | NodeResult::DoNotSend))
    }
}

/// Tracks in-flight cluster commands.
#[derive(Debug, Default)]
pub struct CommandBus {
    next_id: u32,
    inflight: HashMap<u32, ClusterCommand>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self {
            // Id 0 is reserved for untracked frames.
            next_id: 1,
            inflight: HashMap::new(),
        }
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Start tracking a command sent to `recipients`. Returns the
    /// immediate outcome when there is nobody to wait for.
    pub fn track(
        &mut self,
        id: u32,
        ptype: PacketType,
        recipients: &[usize],
        timeout_secs: u64,
        now: u64,
    ) -> Option<CommandOutcome> {
        if recipients.is_empty() {
            return Some(CommandOutcome::AllReplied);
        }

        self.inflight.insert(
            id,
            ClusterCommand {
                id,
                ptype,
                deadline: now + timeout_secs,
                results: recipients
                    .iter()
                    .map(|peer| (*peer, NodeResult::Sent))
                    .collect(),
            },
        );

        None
    }

    /// A reply arrived. Returns the finished command when this reply
    /// completes it.
    pub fn on_reply(
        &mut self,
        id: u32,
        peer: usize,
        reply: PacketType,
    ) -> Option<(ClusterCommand, CommandOutcome)> {
        let command = self.inflight.get_mut(&id)?;

        let outcome = match reply {
            PacketType::Reject => Some(CommandOutcome::Rejected(peer)),
            PacketType::Error => Some(CommandOutcome::Errored(peer)),
            _ => {
                if let Some(entry) = command.results.iter_mut().find(|(p, _)| *p == peer) {
                    entry.1 = NodeResult::Replied;
                }
                if command.all_replied() {
                    Some(CommandOutcome::AllReplied)
                } else {
                    None
                }
            }
        };

        outcome.map(|outcome| (self.inflight.remove(&id).unwrap(), outcome))
    }

    /// Sending to a peer failed. Marked SendError; the command can
    /// then only complete by timeout or rejection.
    pub fn on_send_failed(&mut self, id: u32, peer: usize) {
        if let Some(command) = self.inflight.get_mut(&id) {
            if let Some(entry) = command.results.iter_mut().find(|(p, _)| *p == peer) {
                entry.1 = NodeResult::SendError;
            }
        }
    }

    /// A peer was lost; cancel every command that still waited on it.
    pub fn on_peer_lost(&mut self, peer: usize) -> Vec<(ClusterCommand, CommandOutcome)> {
        let cancelled: Vec<u32> = self
            .inflight
            .values()
            .filter(|command| {
                command
                    .results
                    .iter()
                    .any(|(p, result)| *p == peer && matches!(result, NodeResult::Sent))
            })
            .map(|command| command.id)
            .collect();

        cancelled
            .into_iter()
            .filter_map(|id| self.inflight.remove(&id))
            .map(|command| (command, CommandOutcome::FinishedTimeout))
            .collect()
    }

    /// Collect commands whose deadline passed.
    pub fn expired(&mut self, now: u64) -> Vec<(ClusterCommand, CommandOutcome)> {
        let expired: Vec<u32> = self
            .inflight
            .values()
            .filter(|command| now >= command.deadline)
            .map(|command| command.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.inflight.remove(&id))
            .map(|command| (command, CommandOutcome::FinishedTimeout))
            .collect()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ids_monotonic() {
        let mut bus = CommandBus::new();
        let a = bus.next_id();
        let b = bus.next_id();
        assert!(b > a);
    }

    #[test]
    fn test_all_replied() {
        let mut bus = CommandBus::new();
        let id = bus.next_id();
        assert!(bus
            .track(id, PacketType::StandForCoordinator, &[0, 1], 4, 100)
            .is_none());

        assert!(bus.on_reply(id, 0, PacketType::Accept).is_none());
        let (command, outcome) = bus.on_reply(id, 1, PacketType::Accept).unwrap();

        assert_eq!(outcome, CommandOutcome::AllReplied);
        assert!(command.all_replied());
        assert_eq!(bus.inflight_count(), 0);
    }

    #[test]
    fn test_reject_completes_immediately() {
        let mut bus = CommandBus::new();
        let id = bus.next_id();
        bus.track(id, PacketType::StandForCoordinator, &[0, 1], 4, 100);

        let (_, outcome) = bus.on_reply(id, 1, PacketType::Reject).unwrap();
        assert_eq!(outcome, CommandOutcome::Rejected(1));
        assert_eq!(bus.inflight_count(), 0);
    }

    #[test]
    fn test_no_recipients_completes_instantly() {
        let mut bus = CommandBus::new();
        let id = bus.next_id();
        assert_eq!(
            bus.track(id, PacketType::DeclareCoordinator, &[], 4, 100),
            Some(CommandOutcome::AllReplied)
        );
    }

    #[test]
    fn test_timeout() {
        let mut bus = CommandBus::new();
        let id = bus.next_id();
        bus.track(id, PacketType::ReqInfo, &[0], 5, 100);

        assert!(bus.expired(104).is_empty());
        let expired = bus.expired(105);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1, CommandOutcome::FinishedTimeout);
    }

    #[test]
    fn test_peer_lost_cancels() {
        let mut bus = CommandBus::new();
        let id = bus.next_id();
        bus.track(id, PacketType::JoinCoordinator, &[2], 5, 100);

        let cancelled = bus.on_peer_lost(2);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].1, CommandOutcome::FinishedTimeout);
        assert_eq!(bus.inflight_count(), 0);
    }

    #[test]
    fn test_replies_route_by_id_not_order() {
        let mut bus = CommandBus::new();
        let first = bus.next_id();
        let second = bus.next_id();
        bus.track(first, PacketType::ReqInfo, &[0], 5, 100);
        bus.track(second, PacketType::StandForCoordinator, &[0], 5, 100);

        // Replies arrive out of order; each settles its own command.
        let (command, _) = bus.on_reply(second, 0, PacketType::Accept).unwrap();
        assert_eq!(command.ptype, PacketType::StandForCoordinator);
        let (command, _) = bus.on_reply(first, 0, PacketType::Info).unwrap();
        assert_eq!(command.ptype, PacketType::ReqInfo);
    }
}
