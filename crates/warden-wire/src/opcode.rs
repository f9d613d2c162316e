//! Message opcodes for the warden wire protocol.

use crate::error::WireError;

/// Wire opcodes, grouped into the connect, notify and policy families.
///
/// The connect family drives session negotiation and teardown, the
/// notify family carries asynchronous event traffic, and the policy
/// family carries policy management requests and replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Server greeting with its supported version range
    Hello = 0x1000,
    /// Client's version selection
    VerSel = 0x1001,
    /// Client announces its authentication type
    Auth = 0x1002,
    /// Authentication data exchange (both directions)
    AuthData = 0x1003,
    /// Server's final authentication verdict
    AuthReply = 0x1004,
    /// Client requests connection options
    OptReq = 0x1005,
    /// Server's accepted option subset
    OptAck = 0x1006,
    /// Client selects the sub-protocol set
    ProtoSel = 0x1007,
    /// Close handshake request
    CloseReq = 0x1008,
    /// Close handshake acknowledgment
    CloseAck = 0x1009,
    /// Generic acknowledgment for a tokenized request
    Reply = 0x100A,

    /// Register for notification delivery (client to server only)
    Register = 0x2000,
    /// Unregister from notification delivery (client to server only)
    Unregister = 0x2001,
    /// Server asks the client for a policy verdict
    Ask = 0x2002,
    /// Plain notification event
    Notify = 0x2003,
    /// Log notification event
    LogNotify = 0x2004,
    /// Result of an ask answered by this client
    ResYou = 0x2005,
    /// Result of an ask answered elsewhere
    ResOther = 0x2006,
    /// Delegate an ask verdict to another registration (client to server only)
    Delegate = 0x2007,
    /// Policy database changed on the server
    PolicyChange = 0x2008,
    /// Daemon status change broadcast
    StatusNotify = 0x2009,

    /// Policy request chunk (client to server)
    Request = 0x3000,
    /// Policy reply chunk (server to client)
    PolicyReply = 0x3001,
    /// Checksum listing request
    CsumRequest = 0x3002,
    /// Checksum listing reply chunk
    CsumList = 0x3003,
    /// Batched multi-record checksum/signature request
    CsMultiRequest = 0x3004,
    /// Batched multi-record checksum/signature reply
    CsMultiReply = 0x3005,
    /// Passphrase delivery for key unlocking
    Passphrase = 0x3006,
    /// Daemon version query
    Version = 0x3007,
    /// Daemon version reply
    VersionReply = 0x3008,
}

impl TryFrom<u32> for Opcode {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x1000 => Ok(Self::Hello),
            0x1001 => Ok(Self::VerSel),
            0x1002 => Ok(Self::Auth),
            0x1003 => Ok(Self::AuthData),
            0x1004 => Ok(Self::AuthReply),
            0x1005 => Ok(Self::OptReq),
            0x1006 => Ok(Self::OptAck),
            0x1007 => Ok(Self::ProtoSel),
            0x1008 => Ok(Self::CloseReq),
            0x1009 => Ok(Self::CloseAck),
            0x100A => Ok(Self::Reply),
            0x2000 => Ok(Self::Register),
            0x2001 => Ok(Self::Unregister),
            0x2002 => Ok(Self::Ask),
            0x2003 => Ok(Self::Notify),
            0x2004 => Ok(Self::LogNotify),
            0x2005 => Ok(Self::ResYou),
            0x2006 => Ok(Self::ResOther),
            0x2007 => Ok(Self::Delegate),
            0x2008 => Ok(Self::PolicyChange),
            0x2009 => Ok(Self::StatusNotify),
            0x3000 => Ok(Self::Request),
            0x3001 => Ok(Self::PolicyReply),
            0x3002 => Ok(Self::CsumRequest),
            0x3003 => Ok(Self::CsumList),
            0x3004 => Ok(Self::CsMultiRequest),
            0x3005 => Ok(Self::CsMultiReply),
            0x3006 => Ok(Self::Passphrase),
            0x3007 => Ok(Self::Version),
            0x3008 => Ok(Self::VersionReply),
            _ => Err(WireError::UnknownOpcode(value)),
        }
    }
}

impl Opcode {
    /// Minimum payload size for this opcode.
    ///
    /// Enforced during verification, before any field accessor runs.
    #[must_use]
    pub fn min_payload(self) -> usize {
        match self {
            Self::Hello => 8,
            Self::VerSel | Self::Auth | Self::AuthData => 4,
            Self::AuthReply => 8,
            Self::OptReq | Self::OptAck | Self::ProtoSel => 0,
            Self::CloseReq | Self::CloseAck => 0,
            Self::Reply => 16,
            Self::Register | Self::Unregister => 20,
            Self::Ask => 20,
            Self::Notify | Self::LogNotify | Self::ResYou | Self::ResOther => 12,
            Self::Delegate => 20,
            Self::PolicyChange | Self::StatusNotify => 8,
            Self::Request => 12,
            Self::PolicyReply => 16,
            Self::CsumRequest => 16,
            Self::CsumList => 16,
            Self::CsMultiRequest => 24,
            Self::CsMultiReply => 16,
            Self::Passphrase => 9,
            Self::Version => 8,
            Self::VersionReply => 20,
        }
    }

    /// Whether this opcode is an asynchronous event pushed by the server.
    ///
    /// These are queued for the caller instead of being matched against a
    /// transaction.
    #[must_use]
    pub fn is_notify_event(self) -> bool {
        matches!(
            self,
            Self::Ask
                | Self::Notify
                | Self::LogNotify
                | Self::ResYou
                | Self::ResOther
                | Self::PolicyChange
                | Self::StatusNotify
        )
    }

    /// Whether this opcode may only travel from client to server.
    ///
    /// Receiving one of these is a protocol violation.
    #[must_use]
    pub fn is_client_only(self) -> bool {
        matches!(self, Self::Register | Self::Unregister | Self::Delegate)
    }

    /// Whether this opcode belongs to the close handshake.
    #[must_use]
    pub fn is_close(self) -> bool {
        matches!(self, Self::CloseReq | Self::CloseAck)
    }
}
