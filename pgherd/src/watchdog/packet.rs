//! Watchdog wire protocol.
//!
//! Frame: `type:1 | command_id:u32 BE | length:u32 BE | data`.
//! Payloads are JSON where present.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::net::Error;

/// Frames beyond this are garbage, not messages.
const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Watchdog message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Handshake carrying node identity and auth hash.
    AddNode,
    /// Ask a peer for its current node info.
    ReqInfo,
    /// Claim coordinatorship after winning an election.
    DeclareCoordinator,
    /// JSON payload, meaning depends on context.
    Data,
    /// Negative reply.
    Error,
    /// Positive reply.
    Accept,
    /// Node info reply.
    Info,
    /// Ask the coordinator to take us as standby.
    JoinCoordinator,
    /// Coordinator beacon.
    IAmCoordinator,
    /// Sender lost its network.
    IAmInNwTrouble,
    /// Sender lost quorum.
    QuorumIsLost,
    /// Negative reply.
    Reject,
    /// Candidacy announcement.
    StandForCoordinator,
    /// Clean shutdown notice.
    InformIAmGoingDown,
    /// Ask for pool configuration.
    AskForPoolConfig,
    /// Pool configuration reply.
    PoolConfigData,
    /// Command reply with a JSON payload.
    CmdReplyInData,
    /// Cluster service message; first data byte is the sub-type.
    ClusterService,
    /// Failover execution starting.
    FailoverStart,
    /// Failover execution finished.
    FailoverEnd,
    /// Coordinator is collecting failover votes.
    FailoverWaitingForConsensus,
}

impl PacketType {
    pub fn as_byte(&self) -> u8 {
        use PacketType::*;
        match self {
            AddNode => b'A',
            ReqInfo => b'B',
            DeclareCoordinator => b'C',
            Data => b'D',
            Error => b'E',
            Accept => b'G',
            Info => b'I',
            JoinCoordinator => b'J',
            IAmCoordinator => b'M',
            IAmInNwTrouble => b'N',
            QuorumIsLost => b'Q',
            Reject => b'R',
            StandForCoordinator => b'S',
            InformIAmGoingDown => b'X',
            AskForPoolConfig => b'Y',
            PoolConfigData => b'Z',
            CmdReplyInData => b'-',
            ClusterService => b'#',
            FailoverStart => b'F',
            FailoverEnd => b'H',
            FailoverWaitingForConsensus => b'K',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        use PacketType::*;
        Ok(match byte {
            b'A' => AddNode,
            b'B' => ReqInfo,
            b'C' => DeclareCoordinator,
            b'D' => Data,
            b'E' => Error,
            b'G' => Accept,
            b'I' => Info,
            b'J' => JoinCoordinator,
            b'M' => IAmCoordinator,
            b'N' => IAmInNwTrouble,
            b'Q' => QuorumIsLost,
            b'R' => Reject,
            b'S' => StandForCoordinator,
            b'X' => InformIAmGoingDown,
            b'Y' => AskForPoolConfig,
            b'Z' => PoolConfigData,
            b'-' => CmdReplyInData,
            b'#' => ClusterService,
            b'F' => FailoverStart,
            b'H' => FailoverEnd,
            b'K' => FailoverWaitingForConsensus,
            byte => return Err(crate::net::Error::UnknownPacketType(byte)),
        })
    }

    /// Replies that settle a tracked command.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            PacketType::Accept
                | PacketType::Reject
                | PacketType::Error
                | PacketType::Info
                | PacketType::CmdReplyInData
                | PacketType::PoolConfigData
        )
    }
}

/// Cluster service sub-types, carried as the first byte of a
/// ClusterService frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterServiceMsg {
    /// Arbitration winner telling the loser to resign.
    IAmTrueLeader,
    /// Arbitration loser resigning.
    IAmNotTrueLeader,
    /// Coordinator giving up leadership voluntarily.
    ResigningFromLeader,
    /// Cluster should re-elect from scratch.
    NeedsElection,
    /// Sender thinks a node became unreachable.
    NodeAppearingLost,
    /// Sender reestablished contact with a node.
    NodeAppearingFound,
    /// Ask peers to refresh backend state from the coordinator.
    BackendStateSync,
    /// The delegate IP showed up where it shouldn't be.
    InvalidVip,
}

impl ClusterServiceMsg {
    pub fn as_byte(&self) -> u8 {
        use ClusterServiceMsg::*;
        match self {
            IAmTrueLeader => b'M',
            IAmNotTrueLeader => b'X',
            ResigningFromLeader => b'R',
            NeedsElection => b'E',
            NodeAppearingLost => b'L',
            NodeAppearingFound => b'F',
            BackendStateSync => b'B',
            InvalidVip => b'V',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        use ClusterServiceMsg::*;
        Some(match byte {
            b'M' => IAmTrueLeader,
            b'X' => IAmNotTrueLeader,
            b'R' => ResigningFromLeader,
            b'E' => NeedsElection,
            b'L' => NodeAppearingLost,
            b'F' => NodeAppearingFound,
            b'B' => BackendStateSync,
            b'V' => InvalidVip,
            _ => return None,
        })
    }
}

/// One watchdog frame.
#[derive(Debug, Clone, PartialEq)]
pub struct WdPacket {
    pub ptype: PacketType,
    pub command_id: u32,
    pub data: Bytes,
}

impl WdPacket {
    pub fn new(ptype: PacketType, command_id: u32) -> Self {
        Self {
            ptype,
            command_id,
            data: Bytes::new(),
        }
    }

    pub fn with_data(ptype: PacketType, command_id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            ptype,
            command_id,
            data: data.into(),
        }
    }

    /// JSON-payload frame.
    pub fn with_json(
        ptype: PacketType,
        command_id: u32,
        payload: &impl serde::Serialize,
    ) -> Result<Self, Error> {
        Ok(Self::with_data(
            ptype,
            command_id,
            serde_json::to_vec(payload)?,
        ))
    }

    /// Cluster service frame.
    pub fn service(msg: ClusterServiceMsg, command_id: u32) -> Self {
        Self::with_data(PacketType::ClusterService, command_id, vec![msg.as_byte()])
    }

    /// Sub-type of a ClusterService frame.
    pub fn service_msg(&self) -> Option<ClusterServiceMsg> {
        if self.ptype != PacketType::ClusterService {
            return None;
        }
        self.data.first().copied().and_then(ClusterServiceMsg::from_byte)
    }

    /// Parse the JSON payload.
    pub fn json<'a, T: serde::Deserialize<'a>>(&'a self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(self.ptype.as_byte());
        buf.put_u32(self.command_id);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        let ptype = PacketType::from_byte(bytes.get_u8())?;
        let command_id = bytes.get_u32();
        let len = bytes.get_u32();
        let data = bytes.split_to(len as usize);

        Ok(Self {
            ptype,
            command_id,
            data,
        })
    }

    /// Read one frame off the socket.
    pub async fn read_from(stream: &mut (impl AsyncRead + Unpin)) -> Result<Self, Error> {
        let mut header = [0u8; 9];
        stream.read_exact(&mut header).await?;

        let ptype = PacketType::from_byte(header[0])?;
        let command_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);

        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(len));
        }

        let mut data = vec![0u8; len as usize];
        stream.read_exact(&mut data).await?;

        Ok(Self {
            ptype,
            command_id,
            data: Bytes::from(data),
        })
    }

    /// Write the frame to the socket and flush.
    pub async fn write_to(&self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<(), Error> {
        stream.write_all(&self.to_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_type_bytes_roundtrip() {
        use PacketType::*;
        for ptype in [
            AddNode,
            ReqInfo,
            DeclareCoordinator,
            Data,
            Error,
            Accept,
            Info,
            JoinCoordinator,
            IAmCoordinator,
            IAmInNwTrouble,
            QuorumIsLost,
            Reject,
            StandForCoordinator,
            InformIAmGoingDown,
            AskForPoolConfig,
            PoolConfigData,
            CmdReplyInData,
            ClusterService,
            FailoverStart,
            FailoverEnd,
            FailoverWaitingForConsensus,
        ] {
            assert_eq!(PacketType::from_byte(ptype.as_byte()).unwrap(), ptype);
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let packet = WdPacket::with_data(PacketType::Data, 42, r#"{"x":1}"#.as_bytes().to_vec());
        let parsed = WdPacket::from_bytes(packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let packet = WdPacket::service(ClusterServiceMsg::NeedsElection, 7);

        let mut buf = Vec::new();
        packet.write_to(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let parsed = WdPacket::read_from(&mut cursor).await.unwrap();

        assert_eq!(parsed, packet);
        assert_eq!(
            parsed.service_msg(),
            Some(ClusterServiceMsg::NeedsElection)
        );
    }

    #[test]
    fn test_unknown_type() {
        assert!(PacketType::from_byte(b'z').is_err());
    }
}
