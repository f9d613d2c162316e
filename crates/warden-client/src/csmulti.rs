//! Batched multi-record checksum/signature protocol.
//!
//! One request carries up to a message-capped batch of per-file
//! checksum or signature operations; the reply is a single message with
//! one variable-length result record per addressed request record.
//! Records that did not fit under the payload cap stay pending and are
//! picked up by a follow-up request, which makes the exchange naturally
//! resumable.
//!
//! Fetched checksum payloads are not copied out of the reply: the
//! decoder records offsets into the reply message and ownership of that
//! message moves into the request's reply chain, so the borrows handed
//! out by [`CsMultiRequest::entry`] stay valid for the life of the
//! request.

use crate::channel::Channel;
use crate::error::{ClientError, TxError};
use crate::session::{Session, SessionFlags};
use crate::transaction::{CsMultiState, Outcome, Token, Transaction, TxKind};
use warden_wire::{CSMULTI_PAYLOAD_MAX, MsgBuilder, Opcode, WireMsg};

/// Payload offset of the first reply record (token, operation, error)
const REPLY_RECORDS_OFF: usize = 16;

/// Fixed prefix of a request record (length, index)
const REQ_RECORD_HDR: usize = 8;

/// Fixed prefix of a reply record (length, index, error)
const REPLY_RECORD_HDR: usize = 12;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Batched operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CsMultiOp {
    /// Store a checksum for each path
    AddChecksum = 1,
    /// Store a signature for each path
    AddSignature = 2,
    /// Fetch checksums for each path
    GetChecksum = 3,
    /// Fetch signatures for each path
    GetSignature = 4,
    /// Delete the stored checksum of each path
    DelChecksum = 5,
    /// Delete the stored signature of each path
    DelSignature = 6,
}

impl CsMultiOp {
    /// Signature operations address a key and require a key id
    #[must_use]
    pub fn needs_key(self) -> bool {
        matches!(
            self,
            Self::AddSignature | Self::GetSignature | Self::DelSignature
        )
    }

    /// Add operations carry a checksum payload per record
    #[must_use]
    pub fn is_add(self) -> bool {
        matches!(self, Self::AddChecksum | Self::AddSignature)
    }

    /// Get operations receive checksum payloads in the reply
    #[must_use]
    pub fn is_get(self) -> bool {
        matches!(self, Self::GetChecksum | Self::GetSignature)
    }
}

/// Type tag of a fetched checksum sub-entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CsKind {
    /// Plain checksum
    Checksum = 1,
    /// Signature over the checksum
    Signature = 2,
    /// Checksum recorded by an upgrade
    UpgradeChecksum = 3,
}

impl TryFrom<u32> for CsKind {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            1 => Ok(Self::Checksum),
            2 => Ok(Self::Signature),
            3 => Ok(Self::UpgradeChecksum),
            _ => Err(()),
        }
    }
}

/// Resolution state of one request record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Not yet covered by a reply
    Pending,
    /// Covered by a reply carrying this error code (0 on success)
    Resolved(u32),
}

impl RecordState {
    /// Whether the record still awaits a reply
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Offset of one fetched sub-entry inside an owned reply message
#[derive(Debug, Clone, Copy)]
struct CsEntry {
    kind: CsKind,
    msg: usize,
    off: usize,
    len: usize,
}

/// One per-path entry of a batched request
pub struct CsMultiRecord {
    index: u32,
    path: String,
    state: RecordState,
    checksum: Option<Vec<u8>>,
    entries: Vec<CsEntry>,
}

impl std::fmt::Debug for CsMultiRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsMultiRecord")
            .field("index", &self.index)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("checksum", &self.checksum.as_deref().map(hex::encode))
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl CsMultiRecord {
    /// The record's stable index (assignment order)
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The file path this record addresses
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current resolution state
    #[must_use]
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Whether this record still awaits a reply
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    /// The error a reply resolved this record with, if resolved
    #[must_use]
    pub fn error(&self) -> Option<u32> {
        match self.state {
            RecordState::Pending => None,
            RecordState::Resolved(error) => Some(error),
        }
    }

    fn wire_len(&self, op: CsMultiOp) -> usize {
        let body = if op.is_add() {
            4 + self.checksum.as_deref().map_or(0, <[u8]>::len) + self.path.len() + 1
        } else {
            self.path.len() + 1
        };
        align4(REQ_RECORD_HDR + body)
    }
}

/// A batched multi-record request, owned by the caller.
///
/// Build it up with [`CsMultiRequest::add_path`] or
/// [`CsMultiRequest::add_checksum`], hand it to
/// [`Session::csmulti_start`] (or the blocking [`Session::csmulti`]),
/// and read the per-record results and fetched payloads back out of it.
pub struct CsMultiRequest {
    op: CsMultiOp,
    uid: u32,
    key_id: Option<Vec<u8>>,
    records: Vec<CsMultiRecord>,
    replies: Vec<WireMsg>,
    last_matched: usize,
}

impl std::fmt::Debug for CsMultiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsMultiRequest")
            .field("op", &self.op)
            .field("uid", &self.uid)
            .field("records", &self.records.len())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl CsMultiRequest {
    /// Create a request for the given operation.
    ///
    /// # Errors
    ///
    /// Rejects a key id on checksum operations and a missing key id on
    /// signature operations.
    pub fn new(op: CsMultiOp, uid: u32, key_id: Option<Vec<u8>>) -> Result<Self, ClientError> {
        if op.needs_key() != key_id.is_some() {
            return Err(ClientError::InvalidArgument(
                "key id is required for signature operations and only for them",
            ));
        }
        Ok(Self {
            op,
            uid,
            key_id,
            records: Vec::new(),
            replies: Vec::new(),
            last_matched: 0,
        })
    }

    /// The operation this request performs
    #[must_use]
    pub fn op(&self) -> CsMultiOp {
        self.op
    }

    /// All records, in assignment order
    #[must_use]
    pub fn records(&self) -> &[CsMultiRecord] {
        &self.records
    }

    /// Number of records not yet covered by a reply
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_pending()).count()
    }

    /// Whether every record has been resolved
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pending_count() == 0
    }

    fn push_record(&mut self, path: &str, checksum: Option<Vec<u8>>) -> Result<u32, ClientError> {
        if path.is_empty() || path.as_bytes().contains(&0) {
            return Err(ClientError::InvalidArgument("path is empty or contains a NUL byte"));
        }
        let index = self.records.len() as u32;
        self.records.push(CsMultiRecord {
            index,
            path: path.to_owned(),
            state: RecordState::Pending,
            checksum,
            entries: Vec::new(),
        });
        Ok(index)
    }

    /// Add a path record to a get or delete request.
    ///
    /// Returns the record's index.
    ///
    /// # Errors
    ///
    /// Rejects add operations (use [`CsMultiRequest::add_checksum`]) and
    /// invalid paths.
    pub fn add_path(&mut self, path: &str) -> Result<u32, ClientError> {
        if self.op.is_add() {
            return Err(ClientError::InvalidArgument(
                "add operations require a checksum per record",
            ));
        }
        self.push_record(path, None)
    }

    /// Add a path plus checksum record to an add request.
    ///
    /// Returns the record's index.
    ///
    /// # Errors
    ///
    /// Rejects non-add operations and invalid paths.
    pub fn add_checksum(&mut self, path: &str, checksum: &[u8]) -> Result<u32, ClientError> {
        if !self.op.is_add() {
            return Err(ClientError::InvalidArgument(
                "only add operations carry checksums",
            ));
        }
        self.push_record(path, Some(checksum.to_vec()))
    }

    /// Borrow a fetched sub-entry payload for a resolved get record.
    ///
    /// The returned slice points into the owned reply chain and stays
    /// valid as long as this request lives.
    #[must_use]
    pub fn entry(&self, index: u32, kind: CsKind) -> Option<&[u8]> {
        let record = self.records.iter().find(|r| r.index == index)?;
        let entry = record.entries.iter().find(|e| e.kind == kind)?;
        let msg = self.replies.get(entry.msg)?;
        msg.payload().get(entry.off..entry.off + entry.len)
    }

    /// Encode the next request message from the still-pending records.
    ///
    /// Greedily packs pending records in index order until the payload
    /// cap would be exceeded; the rest stay pending for a follow-up.
    pub(crate) fn encode_next(&self, token: Token) -> Result<Vec<u8>, ClientError> {
        let key = self.key_id.as_deref().unwrap_or(&[]);
        let records_off = align4(24 + key.len());

        let mut builder = MsgBuilder::new(Opcode::CsMultiRequest)
            .u64(token)
            .u32(self.op as u32)
            .u32(self.uid)
            .u32(key.len() as u32)
            .u32(records_off as u32)
            .bytes(key)
            .pad4();

        // Room for the zero-length sentinel record has to stay reserved.
        let mut total = records_off + 4;
        let mut packed = 0usize;
        for record in self.records.iter().filter(|r| r.is_pending()) {
            let len = record.wire_len(self.op);
            if total + len > CSMULTI_PAYLOAD_MAX {
                break;
            }
            builder = builder.u32(len as u32).u32(record.index);
            if self.op.is_add() {
                let checksum = record.checksum.as_deref().unwrap_or(&[]);
                builder = builder.u32(checksum.len() as u32).bytes(checksum);
            }
            builder = builder.cstr(&record.path).pad4();
            total += len;
            packed += 1;
        }

        if packed == 0 {
            return Err(ClientError::InvalidArgument(
                "no pending record fits into a request message",
            ));
        }

        tracing::debug!(packed, remaining = self.pending_count() - packed, "encoded csmulti request");
        Ok(builder.u32(0).finish())
    }

    /// MRU-cached record lookup by reply index
    fn find_record(&mut self, index: u32) -> Option<usize> {
        if let Some(record) = self.records.get(self.last_matched) {
            if record.index == index {
                return Some(self.last_matched);
            }
        }
        let pos = self.records.iter().position(|r| r.index == index)?;
        self.last_matched = pos;
        Some(pos)
    }

    /// Decode a reply message and resolve the records it addresses.
    ///
    /// The whole reply is validated before a single record is touched;
    /// any overrun, malformed sub-entry or operation mismatch rejects it
    /// with zero records resolved.
    pub(crate) fn apply_reply(&mut self, msg: WireMsg) -> Result<(), TxError> {
        let payload_len = msg.payload().len();

        let op = msg.read_u32(8).ok_or(TxError::Protocol)?;
        if op != self.op as u32 {
            tracing::warn!(expected = self.op as u32, got = op, "csmulti reply operation mismatch");
            return Err(TxError::Protocol);
        }
        let request_error = msg.read_u32(12).ok_or(TxError::Protocol)?;
        if request_error != 0 {
            return Err(TxError::Remote(request_error));
        }

        struct Resolved {
            pos: usize,
            error: u32,
            entries: Vec<CsEntry>,
        }

        let msg_slot = self.replies.len();
        let mut resolved = Vec::new();
        let mut off = REPLY_RECORDS_OFF;
        loop {
            let len = msg.read_u32(off).ok_or(TxError::Protocol)? as usize;
            if len == 0 {
                break;
            }
            if len < REPLY_RECORD_HDR || len % 4 != 0 || off + len > payload_len {
                tracing::warn!(off, len, "csmulti reply record overruns the message");
                return Err(TxError::Protocol);
            }
            let index = msg.read_u32(off + 4).ok_or(TxError::Protocol)?;
            let error = msg.read_u32(off + 8).ok_or(TxError::Protocol)?;
            let pos = self.find_record(index).ok_or(TxError::Protocol)?;

            let mut entries = Vec::new();
            if self.op.is_get() && error == 0 {
                let record_end = off + len;
                let mut sub = off + REPLY_RECORD_HDR;
                loop {
                    if sub + 4 > record_end {
                        tracing::warn!("csmulti sub-entries missing terminator");
                        return Err(TxError::Protocol);
                    }
                    let kind_raw = msg.read_u32(sub).ok_or(TxError::Protocol)?;
                    if kind_raw == 0 {
                        break;
                    }
                    let kind = CsKind::try_from(kind_raw).map_err(|()| TxError::Protocol)?;
                    if sub + 8 > record_end {
                        return Err(TxError::Protocol);
                    }
                    let sub_len = msg.read_u32(sub + 4).ok_or(TxError::Protocol)? as usize;
                    if sub_len == 0 {
                        tracing::warn!("zero-length csmulti sub-entry");
                        return Err(TxError::Protocol);
                    }
                    if sub + 8 + sub_len > record_end {
                        tracing::warn!("csmulti sub-entry overruns its record");
                        return Err(TxError::Protocol);
                    }
                    entries.push(CsEntry {
                        kind,
                        msg: msg_slot,
                        off: sub + 8,
                        len: sub_len,
                    });
                    sub += 8 + sub_len;
                }
            }

            resolved.push(Resolved { pos, error, entries });
            off += len;
        }

        // Validation passed; commit and take ownership of the reply so
        // the recorded offsets stay valid.
        for r in resolved {
            let record = &mut self.records[r.pos];
            record.state = RecordState::Resolved(r.error);
            record.entries = r.entries;
        }
        self.replies.push(msg);
        Ok(())
    }
}

/// Advance a csmulti transaction
pub(crate) fn step_csmulti(state: &mut CsMultiState, msg: WireMsg) -> Outcome {
    match state.request.apply_reply(msg) {
        Ok(()) => Outcome::Done(Ok(())),
        Err(err) => Outcome::Done(Err(err)),
    }
}

impl<C: Channel> Session<C> {
    /// Start a batched multi-record request.
    ///
    /// Encodes as many still-pending records as fit under the payload
    /// cap and sends one request message; the request itself moves into
    /// the transaction and is handed back through its
    /// [`Completion`](crate::Completion).
    ///
    /// # Errors
    ///
    /// Rejects synchronously on a zero token, a busy policy slot, a
    /// token collision, an empty batch, or a session that is not
    /// connected.
    pub fn csmulti_start(&mut self, token: Token, request: CsMultiRequest) -> Result<(), ClientError> {
        if token == 0 {
            return Err(ClientError::InvalidArgument("request token must be nonzero"));
        }
        if request.pending_count() == 0 {
            return Err(ClientError::InvalidArgument("request has no pending records"));
        }
        self.claim_policy_slot(token)?;

        let raw = request.encode_next(token)?;
        self.transactions.insert(Transaction::new(
            token,
            TxKind::CsMulti(CsMultiState { request }),
        ))?;
        self.flags.insert(SessionFlags::POLICY_PENDING);
        self.send(&raw)
    }

    /// Run a batched request to completion, blocking on the channel.
    ///
    /// Sends follow-up request messages until no record is pending, then
    /// hands the resolved request back.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::csmulti_start`] rejections, any transaction
    /// failure, and a peer that acknowledges without resolving anything
    /// (which would otherwise loop forever).
    pub fn csmulti(&mut self, token: Token, mut request: CsMultiRequest) -> Result<CsMultiRequest, ClientError> {
        while !request.is_complete() {
            let before = request.pending_count();
            self.csmulti_start(token, request)?;
            let completion = self.wait(token)?;
            request = completion
                .csmulti
                .ok_or(ClientError::Violation("csmulti completion lost its request"))?;
            completion.result.map_err(ClientError::Op)?;
            if request.pending_count() >= before {
                return Err(ClientError::Violation(
                    "csmulti reply resolved no records",
                ));
            }
        }
        Ok(request)
    }
}
