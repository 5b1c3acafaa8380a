use bytes::{Buf, BufMut, Bytes, BytesMut};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};

pub const MAGIC: u64 = 2825672906279293275;

/// Fixed-size connect header exchanged once per TCP connection, little
/// endian throughout. The server echoes it back with its own member id;
/// a rejection echoes zeroed group and member ids.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct ConnectHeader {
    pub magic: U64,
    pub group_id: U64,
    pub member_id: U64,
    pub connection_type: U32,
    pub group_token_1: U64,
    pub group_token_2: U64,
}

pub const CONNECT_HEADER_LEN: usize = std::mem::size_of::<ConnectHeader>();

bitflags::bitflags! {
    /// Connection-type word of the connect header. The low bit requests
    /// per-command CRCs; the remaining bits select the stream kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectionType: u32 {
        const CRC = 1;
        const JOIN = 2;
        const SNAPSHOT = 4;
    }
}

impl ConnectionType {
    pub fn kind(self) -> ConnectionType {
        self & !ConnectionType::CRC
    }

    pub fn is_control(self) -> bool {
        self.kind().is_empty()
    }
}

impl ConnectHeader {
    pub fn new(
        group_id: u64,
        member_id: u64,
        connection_type: ConnectionType,
        token_1: u64,
        token_2: u64,
    ) -> Self {
        Self {
            magic: MAGIC.into(),
            group_id: group_id.into(),
            member_id: member_id.into(),
            connection_type: connection_type.bits().into(),
            group_token_1: token_1.into(),
            group_token_2: token_2.into(),
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        ConnectionType::from_bits_truncate(self.connection_type.get())
    }

    /// The rejection echo: both identities zeroed so the caller can tell
    /// join-rejected apart from a garbled stream.
    pub fn rejection(&self) -> Self {
        let mut echo = *self;
        echo.group_id = 0.into();
        echo.member_id = 0.into();
        echo
    }

    pub fn is_rejection(&self) -> bool {
        self.group_id.get() == 0 && self.member_id.get() == 0
    }
}

pub const COMMAND_HEADER_LEN: usize = 8;
/// A command body never exceeds what the 24-bit length field can carry.
pub const MAX_BODY_LEN: usize = (1 << 24) - 1;

/// Encodes the 8-byte command header: `length:u24 | opcode:u8 | crc:u32`.
pub fn encode_command_header(len: usize, opcode: Opcode, crc: u32) -> [u8; COMMAND_HEADER_LEN] {
    debug_assert!(len <= MAX_BODY_LEN);
    let mut hdr = [0u8; COMMAND_HEADER_LEN];
    hdr[0] = len as u8;
    hdr[1] = (len >> 8) as u8;
    hdr[2] = (len >> 16) as u8;
    hdr[3] = opcode as u8;
    hdr[4..8].copy_from_slice(&crc.to_le_bytes());
    hdr
}

pub fn decode_command_header(hdr: &[u8; COMMAND_HEADER_LEN]) -> Result<(usize, Opcode, u32)> {
    let len = hdr[0] as usize | (hdr[1] as usize) << 8 | (hdr[2] as usize) << 16;
    let opcode = Opcode::from_u8(hdr[3]).ok_or(Error::Protocol("unknown opcode"))?;
    let crc = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
    Ok((len, opcode, crc))
}

/// CRC of one command: CRC32C of the body, folded with the first four
/// header bytes so a frame can never be replayed under another opcode or
/// length.
pub fn command_crc(hdr: &[u8; COMMAND_HEADER_LEN], body: &[u8]) -> u32 {
    crc32c::crc32c(body) ^ u32::from_le_bytes(hdr[0..4].try_into().unwrap())
}

macro_rules! opcodes {
    ($($name:ident = $val:expr,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $val,)*
        }

        impl Opcode {
            pub fn from_u8(v: u8) -> Option<Opcode> {
                $(
                    if v == $val {
                        return Some(Opcode::$name);
                    }
                )*
                None
            }
        }
    };
}

opcodes! {
    Nop = 0,
    RequestVote = 1,
    RequestVoteReply = 2,
    ForceElection = 3,
    QueryTerms = 4,
    QueryTermsReply = 5,
    QueryData = 6,
    QueryDataReply = 7,
    QueryDataReplyMissing = 8,
    WriteData = 9,
    WriteDataReply = 10,
    WriteAndProxy = 11,
    WriteViaProxy = 12,
    SyncCommit = 13,
    SyncCommitReply = 14,
    Compact = 15,
    SnapshotScore = 16,
    SnapshotScoreReply = 17,
    UpdateRole = 18,
    UpdateRoleReply = 19,
    GroupVersion = 20,
    GroupVersionReply = 21,
    GroupFile = 22,
    GroupFileReply = 23,
    LeaderCheck = 24,
    LeaderCheckReply = 25,
}

/// Payload of the `WRITE_DATA` family; `prev_term` names the term of the
/// byte just below `position` (equal to `term` for a mid-term chunk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFrame {
    pub prev_term: u64,
    pub term: u64,
    pub position: u64,
    pub highest: u64,
    pub commit: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Nop,
    RequestVote {
        term: u64,
        candidate_id: u64,
        highest_term: u64,
        highest_position: u64,
    },
    /// Negative `term` denies the vote for `-term`.
    RequestVoteReply { term: i64 },
    ForceElection,
    QueryTerms {
        start: u64,
        end: u64,
    },
    QueryTermsReply {
        terms: Vec<(u64, u64, u64)>,
    },
    QueryData {
        start: u64,
        end: u64,
    },
    QueryDataReply {
        current_term: u64,
        frame: WriteFrame,
    },
    QueryDataReplyMissing {
        current_term: u64,
        start: u64,
        end: u64,
    },
    WriteData(WriteFrame),
    WriteDataReply {
        term: u64,
        highest: u64,
    },
    WriteAndProxy(WriteFrame),
    WriteViaProxy(WriteFrame),
    SyncCommit {
        prev_term: u64,
        term: u64,
        position: u64,
    },
    /// `-1` when the requested position exceeds the replier's highest.
    SyncCommitReply { position: i64 },
    Compact {
        position: u64,
    },
    SnapshotScore,
    SnapshotScoreReply {
        active_sessions: u32,
        weight: f32,
    },
    UpdateRole {
        group_version: u64,
        member_id: u64,
        role: u8,
    },
    UpdateRoleReply {
        group_version: u64,
        result: u8,
    },
    GroupVersion {
        version: u64,
    },
    GroupVersionReply {
        version: u64,
    },
    GroupFile {
        version: u64,
    },
    GroupFileReply {
        version: u64,
        data: Bytes,
    },
    LeaderCheck,
    /// `-1` when the replier knows no validated leader.
    LeaderCheckReply { term: i64 },
}

/// Fixed-field width of the write family, ahead of the data blob.
const WRITE_FIXED: usize = 40;
/// Fixed-field width of `QUERY_DATA_REPLY`.
const QUERY_DATA_FIXED: usize = 48;

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Nop => Opcode::Nop,
            Command::RequestVote { .. } => Opcode::RequestVote,
            Command::RequestVoteReply { .. } => Opcode::RequestVoteReply,
            Command::ForceElection => Opcode::ForceElection,
            Command::QueryTerms { .. } => Opcode::QueryTerms,
            Command::QueryTermsReply { .. } => Opcode::QueryTermsReply,
            Command::QueryData { .. } => Opcode::QueryData,
            Command::QueryDataReply { .. } => Opcode::QueryDataReply,
            Command::QueryDataReplyMissing { .. } => Opcode::QueryDataReplyMissing,
            Command::WriteData(_) => Opcode::WriteData,
            Command::WriteDataReply { .. } => Opcode::WriteDataReply,
            Command::WriteAndProxy(_) => Opcode::WriteAndProxy,
            Command::WriteViaProxy(_) => Opcode::WriteViaProxy,
            Command::SyncCommit { .. } => Opcode::SyncCommit,
            Command::SyncCommitReply { .. } => Opcode::SyncCommitReply,
            Command::Compact { .. } => Opcode::Compact,
            Command::SnapshotScore => Opcode::SnapshotScore,
            Command::SnapshotScoreReply { .. } => Opcode::SnapshotScoreReply,
            Command::UpdateRole { .. } => Opcode::UpdateRole,
            Command::UpdateRoleReply { .. } => Opcode::UpdateRoleReply,
            Command::GroupVersion { .. } => Opcode::GroupVersion,
            Command::GroupVersionReply { .. } => Opcode::GroupVersionReply,
            Command::GroupFile { .. } => Opcode::GroupFile,
            Command::GroupFileReply { .. } => Opcode::GroupFileReply,
            Command::LeaderCheck => Opcode::LeaderCheck,
            Command::LeaderCheckReply { .. } => Opcode::LeaderCheckReply,
        }
    }

    fn encode_body(&self, body: &mut BytesMut) {
        match self {
            Command::Nop | Command::ForceElection | Command::SnapshotScore
            | Command::LeaderCheck => {}
            Command::RequestVote {
                term,
                candidate_id,
                highest_term,
                highest_position,
            } => {
                body.put_u64_le(*term);
                body.put_u64_le(*candidate_id);
                body.put_u64_le(*highest_term);
                body.put_u64_le(*highest_position);
            }
            Command::RequestVoteReply { term } => body.put_i64_le(*term),
            Command::QueryTerms { start, end } | Command::QueryData { start, end } => {
                body.put_u64_le(*start);
                body.put_u64_le(*end);
            }
            Command::QueryTermsReply { terms } => {
                for (prev_term, term, start) in terms {
                    body.put_u64_le(*prev_term);
                    body.put_u64_le(*term);
                    body.put_u64_le(*start);
                }
            }
            Command::QueryDataReply {
                current_term,
                frame,
            } => {
                body.put_u64_le(*current_term);
                put_write_frame(body, frame);
            }
            Command::QueryDataReplyMissing {
                current_term,
                start,
                end,
            } => {
                body.put_u64_le(*current_term);
                body.put_u64_le(*start);
                body.put_u64_le(*end);
            }
            Command::WriteData(frame)
            | Command::WriteAndProxy(frame)
            | Command::WriteViaProxy(frame) => put_write_frame(body, frame),
            Command::WriteDataReply { term, highest } => {
                body.put_u64_le(*term);
                body.put_u64_le(*highest);
            }
            Command::SyncCommit {
                prev_term,
                term,
                position,
            } => {
                body.put_u64_le(*prev_term);
                body.put_u64_le(*term);
                body.put_u64_le(*position);
            }
            Command::SyncCommitReply { position } => body.put_i64_le(*position),
            Command::Compact { position } => body.put_u64_le(*position),
            Command::SnapshotScoreReply {
                active_sessions,
                weight,
            } => {
                body.put_u32_le(*active_sessions);
                body.put_f32_le(*weight);
            }
            Command::UpdateRole {
                group_version,
                member_id,
                role,
            } => {
                body.put_u64_le(*group_version);
                body.put_u64_le(*member_id);
                body.put_u8(*role);
            }
            Command::UpdateRoleReply {
                group_version,
                result,
            } => {
                body.put_u64_le(*group_version);
                body.put_u8(*result);
            }
            Command::GroupVersion { version } | Command::GroupFile { version } => {
                body.put_u64_le(*version)
            }
            Command::GroupVersionReply { version } => body.put_u64_le(*version),
            Command::GroupFileReply { version, data } => {
                body.put_u64_le(*version);
                body.put_slice(data);
            }
            Command::LeaderCheckReply { term } => body.put_i64_le(*term),
        }
    }

    /// Splits this command into wire commands whose bodies respect the
    /// 24-bit length field, then appends the framed bytes to `out`.
    /// Only the data-carrying commands ever produce more than one frame.
    pub fn encode(&self, crc_enabled: bool, out: &mut BytesMut) {
        match self {
            Command::WriteData(frame) => {
                for part in split_write_frame(frame, MAX_BODY_LEN - WRITE_FIXED) {
                    encode_one(&Command::WriteData(part), crc_enabled, out);
                }
            }
            Command::WriteAndProxy(frame) => {
                for part in split_write_frame(frame, MAX_BODY_LEN - WRITE_FIXED) {
                    encode_one(&Command::WriteAndProxy(part), crc_enabled, out);
                }
            }
            Command::WriteViaProxy(frame) => {
                for part in split_write_frame(frame, MAX_BODY_LEN - WRITE_FIXED) {
                    encode_one(&Command::WriteViaProxy(part), crc_enabled, out);
                }
            }
            Command::QueryDataReply {
                current_term,
                frame,
            } => {
                for part in split_write_frame(frame, MAX_BODY_LEN - QUERY_DATA_FIXED) {
                    encode_one(
                        &Command::QueryDataReply {
                            current_term: *current_term,
                            frame: part,
                        },
                        crc_enabled,
                        out,
                    );
                }
            }
            _ => encode_one(self, crc_enabled, out),
        }
    }

    pub fn decode(opcode: Opcode, mut body: Bytes) -> Result<Command> {
        let cmd = match opcode {
            Opcode::Nop => Command::Nop,
            Opcode::ForceElection => Command::ForceElection,
            Opcode::SnapshotScore => Command::SnapshotScore,
            Opcode::LeaderCheck => Command::LeaderCheck,
            Opcode::RequestVote => {
                check_len(&body, 32)?;
                Command::RequestVote {
                    term: body.get_u64_le(),
                    candidate_id: body.get_u64_le(),
                    highest_term: body.get_u64_le(),
                    highest_position: body.get_u64_le(),
                }
            }
            Opcode::RequestVoteReply => {
                check_len(&body, 8)?;
                Command::RequestVoteReply {
                    term: body.get_i64_le(),
                }
            }
            Opcode::QueryTerms => {
                check_len(&body, 16)?;
                Command::QueryTerms {
                    start: body.get_u64_le(),
                    end: body.get_u64_le(),
                }
            }
            Opcode::QueryTermsReply => {
                if body.len() % 24 != 0 {
                    return Err(Error::Protocol("ragged term list"));
                }
                let mut terms = Vec::with_capacity(body.len() / 24);
                while body.has_remaining() {
                    terms.push((body.get_u64_le(), body.get_u64_le(), body.get_u64_le()));
                }
                Command::QueryTermsReply { terms }
            }
            Opcode::QueryData => {
                check_len(&body, 16)?;
                Command::QueryData {
                    start: body.get_u64_le(),
                    end: body.get_u64_le(),
                }
            }
            Opcode::QueryDataReply => {
                check_len(&body, QUERY_DATA_FIXED)?;
                let current_term = body.get_u64_le();
                Command::QueryDataReply {
                    current_term,
                    frame: get_write_frame(&mut body),
                }
            }
            Opcode::QueryDataReplyMissing => {
                check_len(&body, 24)?;
                Command::QueryDataReplyMissing {
                    current_term: body.get_u64_le(),
                    start: body.get_u64_le(),
                    end: body.get_u64_le(),
                }
            }
            Opcode::WriteData => {
                check_len(&body, WRITE_FIXED)?;
                Command::WriteData(get_write_frame(&mut body))
            }
            Opcode::WriteAndProxy => {
                check_len(&body, WRITE_FIXED)?;
                Command::WriteAndProxy(get_write_frame(&mut body))
            }
            Opcode::WriteViaProxy => {
                check_len(&body, WRITE_FIXED)?;
                Command::WriteViaProxy(get_write_frame(&mut body))
            }
            Opcode::WriteDataReply => {
                check_len(&body, 16)?;
                Command::WriteDataReply {
                    term: body.get_u64_le(),
                    highest: body.get_u64_le(),
                }
            }
            Opcode::SyncCommit => {
                check_len(&body, 24)?;
                Command::SyncCommit {
                    prev_term: body.get_u64_le(),
                    term: body.get_u64_le(),
                    position: body.get_u64_le(),
                }
            }
            Opcode::SyncCommitReply => {
                check_len(&body, 8)?;
                Command::SyncCommitReply {
                    position: body.get_i64_le(),
                }
            }
            Opcode::Compact => {
                check_len(&body, 8)?;
                Command::Compact {
                    position: body.get_u64_le(),
                }
            }
            Opcode::SnapshotScoreReply => {
                check_len(&body, 8)?;
                Command::SnapshotScoreReply {
                    active_sessions: body.get_u32_le(),
                    weight: body.get_f32_le(),
                }
            }
            Opcode::UpdateRole => {
                check_len(&body, 17)?;
                Command::UpdateRole {
                    group_version: body.get_u64_le(),
                    member_id: body.get_u64_le(),
                    role: body.get_u8(),
                }
            }
            Opcode::UpdateRoleReply => {
                check_len(&body, 9)?;
                Command::UpdateRoleReply {
                    group_version: body.get_u64_le(),
                    result: body.get_u8(),
                }
            }
            Opcode::GroupVersion => {
                check_len(&body, 8)?;
                Command::GroupVersion {
                    version: body.get_u64_le(),
                }
            }
            Opcode::GroupVersionReply => {
                check_len(&body, 8)?;
                Command::GroupVersionReply {
                    version: body.get_u64_le(),
                }
            }
            Opcode::GroupFile => {
                check_len(&body, 8)?;
                Command::GroupFile {
                    version: body.get_u64_le(),
                }
            }
            Opcode::GroupFileReply => {
                check_len(&body, 8)?;
                let version = body.get_u64_le();
                Command::GroupFileReply {
                    version,
                    data: body,
                }
            }
            Opcode::LeaderCheckReply => {
                check_len(&body, 8)?;
                Command::LeaderCheckReply {
                    term: body.get_i64_le(),
                }
            }
        };
        Ok(cmd)
    }
}

fn check_len(body: &Bytes, at_least: usize) -> Result<()> {
    if body.len() < at_least {
        return Err(Error::Protocol("short command body"));
    }
    Ok(())
}

fn put_write_frame(body: &mut BytesMut, frame: &WriteFrame) {
    body.put_u64_le(frame.prev_term);
    body.put_u64_le(frame.term);
    body.put_u64_le(frame.position);
    body.put_u64_le(frame.highest);
    body.put_u64_le(frame.commit);
    body.put_slice(&frame.data);
}

fn get_write_frame(body: &mut Bytes) -> WriteFrame {
    WriteFrame {
        prev_term: body.get_u64_le(),
        term: body.get_u64_le(),
        position: body.get_u64_le(),
        highest: body.get_u64_le(),
        commit: body.get_u64_le(),
        data: body.split_off(0),
    }
}

/// Splits a write frame so each part's data fits `max_data` bytes, with
/// each part's position advanced past its predecessors. Chunks after the
/// first are mid-term by construction, so their `prev_term` is the term
/// itself.
fn split_write_frame(frame: &WriteFrame, max_data: usize) -> Vec<WriteFrame> {
    if frame.data.len() <= max_data {
        return vec![frame.clone()];
    }
    let mut parts = Vec::with_capacity(frame.data.len() / max_data + 1);
    let mut offset = 0usize;
    while offset < frame.data.len() {
        let len = max_data.min(frame.data.len() - offset);
        parts.push(WriteFrame {
            prev_term: if offset == 0 {
                frame.prev_term
            } else {
                frame.term
            },
            term: frame.term,
            position: frame.position + offset as u64,
            highest: frame.highest,
            commit: frame.commit,
            data: frame.data.slice(offset..offset + len),
        });
        offset += len;
    }
    parts
}

fn encode_one(cmd: &Command, crc_enabled: bool, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    cmd.encode_body(&mut body);
    debug_assert!(body.len() <= MAX_BODY_LEN);
    let mut hdr = encode_command_header(body.len(), cmd.opcode(), 0);
    if crc_enabled {
        let crc = command_crc(&hdr, &body);
        hdr[4..8].copy_from_slice(&crc.to_le_bytes());
    }
    out.put_slice(&hdr);
    out.put_slice(&body);
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(cmd: Command) {
        for crc in [false, true] {
            let mut out = BytesMut::new();
            cmd.encode(crc, &mut out);
            let mut out = out.freeze();

            let hdr: [u8; COMMAND_HEADER_LEN] =
                out.split_to(COMMAND_HEADER_LEN).as_ref().try_into().unwrap();
            let (len, opcode, sent_crc) = decode_command_header(&hdr).unwrap();
            assert_eq!(len, out.len());
            if crc {
                assert_eq!(sent_crc, command_crc(&hdr, &out));
            } else {
                assert_eq!(sent_crc, 0);
            }
            let decoded = Command::decode(opcode, out).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn commands_round_trip() {
        round_trip(Command::Nop);
        round_trip(Command::RequestVote {
            term: 7,
            candidate_id: 3,
            highest_term: 6,
            highest_position: 4096,
        });
        round_trip(Command::RequestVoteReply { term: -7 });
        round_trip(Command::ForceElection);
        round_trip(Command::QueryTerms { start: 0, end: 100 });
        round_trip(Command::QueryTermsReply {
            terms: vec![(0, 1, 0), (1, 2, 512)],
        });
        round_trip(Command::QueryData { start: 10, end: 90 });
        round_trip(Command::QueryDataReply {
            current_term: 4,
            frame: WriteFrame {
                prev_term: 3,
                term: 4,
                position: 100,
                highest: 200,
                commit: 150,
                data: Bytes::from_static(b"payload"),
            },
        });
        round_trip(Command::QueryDataReplyMissing {
            current_term: 4,
            start: 5,
            end: 10,
        });
        round_trip(Command::WriteData(WriteFrame {
            prev_term: 1,
            term: 2,
            position: 0,
            highest: 11,
            commit: 0,
            data: Bytes::from_static(b"hello world"),
        }));
        round_trip(Command::WriteDataReply {
            term: 2,
            highest: 11,
        });
        round_trip(Command::SyncCommit {
            prev_term: 1,
            term: 2,
            position: 64,
        });
        round_trip(Command::SyncCommitReply { position: -1 });
        round_trip(Command::Compact { position: 4096 });
        round_trip(Command::SnapshotScore);
        round_trip(Command::SnapshotScoreReply {
            active_sessions: 2,
            weight: -1.0,
        });
        round_trip(Command::UpdateRole {
            group_version: 9,
            member_id: 2,
            role: 1,
        });
        round_trip(Command::UpdateRoleReply {
            group_version: 9,
            result: 0,
        });
        round_trip(Command::GroupVersion { version: 3 });
        round_trip(Command::GroupVersionReply { version: 3 });
        round_trip(Command::GroupFile { version: 3 });
        round_trip(Command::GroupFileReply {
            version: 4,
            data: Bytes::from_static(b"id=1"),
        });
        round_trip(Command::LeaderCheck);
        round_trip(Command::LeaderCheckReply { term: -1 });
    }

    #[test]
    fn crc_detects_corruption() {
        let cmd = Command::WriteData(WriteFrame {
            prev_term: 1,
            term: 1,
            position: 0,
            highest: 4,
            commit: 0,
            data: Bytes::from_static(b"data"),
        });
        let mut out = BytesMut::new();
        cmd.encode(true, &mut out);
        let mut raw = out.to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;

        let hdr: [u8; COMMAND_HEADER_LEN] = raw[..COMMAND_HEADER_LEN].try_into().unwrap();
        let (_, _, sent_crc) = decode_command_header(&hdr).unwrap();
        assert_ne!(sent_crc, command_crc(&hdr, &raw[COMMAND_HEADER_LEN..]));
    }

    #[test]
    fn oversized_write_splits_and_positions_advance() {
        let data = Bytes::from(vec![0xabu8; MAX_BODY_LEN + 1000]);
        let total = data.len();
        let frame = WriteFrame {
            prev_term: 1,
            term: 2,
            position: 5000,
            highest: 5000 + total as u64,
            commit: 100,
            data,
        };
        let mut out = BytesMut::new();
        Command::WriteData(frame.clone()).encode(true, &mut out);
        let mut out = out.freeze();

        let mut seen = Vec::new();
        while !out.is_empty() {
            let hdr: [u8; COMMAND_HEADER_LEN] =
                out.split_to(COMMAND_HEADER_LEN).as_ref().try_into().unwrap();
            let (len, opcode, crc) = decode_command_header(&hdr).unwrap();
            let body = out.split_to(len);
            assert_eq!(crc, command_crc(&hdr, &body));
            match Command::decode(opcode, body).unwrap() {
                Command::WriteData(part) => seen.push(part),
                other => panic!("unexpected command {other:?}"),
            }
        }

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].position, 5000);
        assert_eq!(seen[0].prev_term, 1);
        assert_eq!(seen[1].position, 5000 + seen[0].data.len() as u64);
        // a continuation chunk is mid-term by construction
        assert_eq!(seen[1].prev_term, 2);
        let reassembled: usize = seen.iter().map(|p| p.data.len()).sum();
        assert_eq!(reassembled, total);
        for part in &seen {
            assert_eq!(part.highest, frame.highest);
            assert_eq!(part.commit, frame.commit);
        }
    }

    #[test]
    fn connect_header_layout() {
        assert_eq!(CONNECT_HEADER_LEN, 44);
        let hdr = ConnectHeader::new(10, 2, ConnectionType::CRC, 0xAA, 0xBB);
        let bytes = hdr.as_bytes();
        assert_eq!(&bytes[0..8], &MAGIC.to_le_bytes());
        assert_eq!(&bytes[8..16], &10u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &2u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &1u32.to_le_bytes());
        assert_eq!(&bytes[28..36], &0xAAu64.to_le_bytes());
        assert_eq!(&bytes[36..44], &0xBBu64.to_le_bytes());

        let parsed = ConnectHeader::read_from(bytes).unwrap();
        assert!(parsed.connection_type().contains(ConnectionType::CRC));
        assert!(parsed.connection_type().is_control());
        assert!(!parsed.is_rejection());
        assert!(parsed.rejection().is_rejection());
    }
}
