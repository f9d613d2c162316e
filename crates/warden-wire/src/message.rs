//! Verified wire messages and the outbound message builder.
//!
//! A [`WireMsg`] is only ever constructed through [`WireMsg::verify`],
//! which checks the buffer length, opcode, CRC and per-opcode minimum
//! payload size in that order and fails closed. Typed views borrow from
//! the verified buffer; none of them can read past the end of it.

use crate::error::WireError;
use crate::opcode::Opcode;
use crate::HEADER_SIZE;

fn be32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn be64(data: &[u8], off: usize) -> u64 {
    u64::from_be_bytes([
        data[off],
        data[off + 1],
        data[off + 2],
        data[off + 3],
        data[off + 4],
        data[off + 5],
        data[off + 6],
        data[off + 7],
    ])
}

/// A verified, immutable wire message.
///
/// Owns its buffer. The opcode, CRC and minimum payload size have been
/// checked on construction; field views never re-validate those.
#[derive(Clone)]
pub struct WireMsg {
    buf: Vec<u8>,
    opcode: Opcode,
}

impl std::fmt::Debug for WireMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireMsg")
            .field("opcode", &self.opcode)
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

impl WireMsg {
    /// Verify a raw buffer and take ownership of it.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] if the buffer is shorter than the header,
    /// carries an unknown opcode, fails the CRC check, or its payload is
    /// smaller than the minimum for its opcode. A rejected buffer is
    /// never partially trusted.
    pub fn verify(buf: Vec<u8>) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let opcode = Opcode::try_from(be32(&buf, 4))?;

        let stored = be32(&buf, 0);
        let computed = crc32c::crc32c(&buf[4..]);
        if stored != computed {
            return Err(WireError::CrcMismatch {
                expected: stored,
                got: computed,
            });
        }

        let payload_len = buf.len() - HEADER_SIZE;
        if payload_len < opcode.min_payload() {
            return Err(WireError::PayloadTooShort {
                opcode,
                expected: opcode.min_payload(),
                actual: payload_len,
            });
        }

        Ok(Self { buf, opcode })
    }

    /// Get the message opcode
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Get the payload slice (everything after the header)
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    /// Consume the message and return the raw buffer
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// The correlation token, for opcodes whose payload leads with one.
    ///
    /// Connect-phase negotiation messages and the broadcast notification
    /// opcodes carry no token and return `None`; the dispatcher treats
    /// them as session-scoped (token 0).
    #[must_use]
    pub fn token(&self) -> Option<u64> {
        match self.opcode {
            Opcode::Reply
            | Opcode::Register
            | Opcode::Unregister
            | Opcode::Ask
            | Opcode::Notify
            | Opcode::LogNotify
            | Opcode::ResYou
            | Opcode::ResOther
            | Opcode::Delegate
            | Opcode::Request
            | Opcode::PolicyReply
            | Opcode::CsumRequest
            | Opcode::CsumList
            | Opcode::CsMultiRequest
            | Opcode::CsMultiReply
            | Opcode::Passphrase
            | Opcode::Version
            | Opcode::VersionReply => Some(be64(self.payload(), 0)),
            _ => None,
        }
    }

    /// Read a big-endian u32 at a payload offset, bounds-checked.
    ///
    /// Returns `None` instead of panicking when the field would run past
    /// the end of the payload; length fields read this way can be
    /// distrusted safely.
    #[must_use]
    pub fn read_u32(&self, off: usize) -> Option<u32> {
        let p = self.payload();
        let bytes = p.get(off..off.checked_add(4)?)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a big-endian u64 at a payload offset, bounds-checked
    #[must_use]
    pub fn read_u64(&self, off: usize) -> Option<u64> {
        let p = self.payload();
        let bytes = p.get(off..off.checked_add(8)?)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(u64::from_be_bytes(buf))
    }

    fn expect(&self, opcode: Opcode) -> Result<(), WireError> {
        if self.opcode == opcode {
            Ok(())
        } else {
            Err(WireError::WrongOpcode {
                expected: opcode,
                got: self.opcode,
            })
        }
    }

    /// View a `Hello` greeting.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::WrongOpcode`] for any other message type.
    pub fn hello(&self) -> Result<Hello, WireError> {
        self.expect(Opcode::Hello)?;
        let p = self.payload();
        Ok(Hello {
            min_version: be32(p, 0),
            version: be32(p, 4),
        })
    }

    /// View a generic `Reply` acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::WrongOpcode`] for any other message type, or
    /// [`WireError::UnknownOpcode`] if the acked opcode field is outside
    /// the known space.
    pub fn ack(&self) -> Result<Ack, WireError> {
        self.expect(Opcode::Reply)?;
        let p = self.payload();
        Ok(Ack {
            token: be64(p, 0),
            acked: Opcode::try_from(be32(p, 8))?,
            error: be32(p, 12),
        })
    }

    /// View an inbound `AuthData` challenge.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::WrongOpcode`] for any other message type.
    pub fn auth_challenge(&self) -> Result<AuthChallenge<'_>, WireError> {
        self.expect(Opcode::AuthData)?;
        let p = self.payload();
        Ok(AuthChallenge {
            auth_type: be32(p, 0),
            data: &p[4..],
        })
    }

    /// View an `AuthReply` verdict.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::WrongOpcode`] for any other message type.
    pub fn auth_reply(&self) -> Result<AuthReply<'_>, WireError> {
        self.expect(Opcode::AuthReply)?;
        let p = self.payload();
        Ok(AuthReply {
            error: be32(p, 0),
            uid: be32(p, 4),
            data: &p[8..],
        })
    }

    /// View a streamed reply chunk (`PolicyReply` or `CsumList`).
    ///
    /// # Errors
    ///
    /// Returns [`WireError::WrongOpcode`] unless the message carries the
    /// given streamed opcode.
    pub fn stream_chunk(&self, opcode: Opcode) -> Result<StreamChunk<'_>, WireError> {
        if !matches!(opcode, Opcode::PolicyReply | Opcode::CsumList) {
            return Err(WireError::WrongOpcode {
                expected: opcode,
                got: self.opcode,
            });
        }
        self.expect(opcode)?;
        let p = self.payload();
        Ok(StreamChunk {
            token: be64(p, 0),
            flags: be32(p, 8),
            error: be32(p, 12),
            data: &p[16..],
        })
    }

    /// View a `VersionReply`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::WrongOpcode`] for any other message type.
    pub fn version_info(&self) -> Result<VersionInfo, WireError> {
        self.expect(Opcode::VersionReply)?;
        let p = self.payload();
        Ok(VersionInfo {
            token: be64(p, 0),
            error: be32(p, 8),
            protocol: be32(p, 12),
            policy_lang: be32(p, 16),
        })
    }

    /// Split a NUL-separated string-list payload (`OptReq`/`OptAck`).
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BadString`] if any element is not UTF-8.
    pub fn string_list(&self) -> Result<Vec<&str>, WireError> {
        self.payload()
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| std::str::from_utf8(s).map_err(|_| WireError::BadString))
            .collect()
    }
}

/// Fields of a `Hello` greeting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Lowest version the server still accepts
    pub min_version: u32,
    /// The server's native version
    pub version: u32,
}

/// Fields of a generic `Reply` acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Token of the acked request (0 for session-scoped operations)
    pub token: u64,
    /// Opcode of the request being acknowledged
    pub acked: Opcode,
    /// Error reported by the peer (0 on success)
    pub error: u32,
}

/// Fields of an inbound `AuthData` challenge
#[derive(Debug, Clone, Copy)]
pub struct AuthChallenge<'a> {
    /// Authentication type the challenge belongs to
    pub auth_type: u32,
    /// Opaque challenge bytes
    pub data: &'a [u8],
}

/// Fields of an `AuthReply` verdict
#[derive(Debug, Clone, Copy)]
pub struct AuthReply<'a> {
    /// Authentication error (0 on success)
    pub error: u32,
    /// Authenticated user id assigned by the server
    pub uid: u32,
    /// Opaque trailing data
    pub data: &'a [u8],
}

/// Fields of a streamed reply chunk (`PolicyReply`/`CsumList`)
#[derive(Debug, Clone, Copy)]
pub struct StreamChunk<'a> {
    /// Correlation token
    pub token: u64,
    /// Stream flags ([`crate::STREAM_START`]/[`crate::STREAM_END`])
    pub flags: u32,
    /// Error reported by the peer (terminates the stream if nonzero)
    pub error: u32,
    /// Chunk payload
    pub data: &'a [u8],
}

/// Fields of a `VersionReply`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Correlation token
    pub token: u64,
    /// Error reported by the peer (0 on success)
    pub error: u32,
    /// Protocol version the daemon speaks
    pub protocol: u32,
    /// Policy language version the daemon understands
    pub policy_lang: u32,
}

/// Builder for outbound wire messages.
///
/// Appends big-endian fields to the payload and stamps the CRC on
/// [`MsgBuilder::finish`].
#[derive(Debug)]
pub struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    /// Start a message with the given opcode
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        let mut buf = vec![0u8; 4];
        buf.extend_from_slice(&(opcode as u32).to_be_bytes());
        Self { buf }
    }

    /// Append a big-endian u32 field
    #[must_use]
    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a big-endian u64 field
    #[must_use]
    pub fn u64(mut self, value: u64) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append raw bytes
    #[must_use]
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Append a NUL-terminated string
    #[must_use]
    pub fn cstr(mut self, s: &str) -> Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    /// Pad the payload with zero bytes to a 4-byte boundary
    #[must_use]
    pub fn pad4(mut self) -> Self {
        while (self.buf.len() - HEADER_SIZE) % 4 != 0 {
            self.buf.push(0);
        }
        self
    }

    /// Current payload length
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    /// Stamp the CRC and return the finished buffer
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        let crc = crc32c::crc32c(&self.buf[4..]);
        self.buf[0..4].copy_from_slice(&crc.to_be_bytes());
        self.buf
    }
}
