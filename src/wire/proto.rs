use std::io::{Cursor, Read, Write};

use arrayref::array_ref;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result, ResultCode};

pub const PROTO_VERSION: u8 = 2;
pub const PROTO_HEADER_SIZE: usize = 8;
/// Size of the message header that follows the proto header of a record
/// command.
pub const MSG_HEADER_SIZE: usize = 22;
pub const FIELD_HEADER_SIZE: usize = 5;
pub const OP_HEADER_SIZE: usize = 8;
/// Largest body accepted from a node.
pub const MAX_BODY_SIZE: u64 = 128 * 1024 * 1024;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Info = 1,
    Admin = 2,
    Message = 3,
    Compressed = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageType::Info,
            2 => MessageType::Admin,
            3 => MessageType::Message,
            4 => MessageType::Compressed,
            other => Err(Error::client(format!("Invalid proto type {}", other)))?,
        })
    }
}

/// The 8 byte frame prefix: 1 byte version, 1 byte type and a 6 byte big
/// endian body size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtoHeader {
    pub version: u8,
    pub msg_type: u8,
    pub size: u64,
}

impl ProtoHeader {
    pub fn new(msg_type: MessageType, size: usize) -> Self {
        Self {
            version: PROTO_VERSION,
            msg_type: msg_type as u8,
            size: size as u64,
        }
    }

    pub fn parse(buf: &[u8; PROTO_HEADER_SIZE]) -> Self {
        Self {
            version: buf[0],
            msg_type: buf[1],
            size: BigEndian::read_uint(&buf[2..], 6),
        }
    }

    pub fn to_bytes(&self) -> [u8; PROTO_HEADER_SIZE] {
        let mut buf = [0u8; PROTO_HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.msg_type;
        BigEndian::write_uint(&mut buf[2..], self.size, 6);
        buf
    }

    pub fn msg_type(&self) -> Result<MessageType> {
        MessageType::try_from(self.msg_type)
    }

    /// Size checked against the body limit.
    pub fn body_size(&self) -> Result<usize> {
        if self.size > MAX_BODY_SIZE {
            Err(Error::client(format!("Invalid proto size {}", self.size)))?
        }
        Ok(self.size as usize)
    }
}

pub mod info1 {
    pub const READ: u8 = 1 << 0;
    pub const GET_ALL: u8 = 1 << 1;
    pub const BATCH: u8 = 1 << 3;
    pub const NOBINDATA: u8 = 1 << 5;
}

pub mod info2 {
    pub const WRITE: u8 = 1 << 0;
    pub const DELETE: u8 = 1 << 1;
    pub const GENERATION: u8 = 1 << 2;
    pub const DURABLE_DELETE: u8 = 1 << 4;
    pub const CREATE_ONLY: u8 = 1 << 5;
    pub const RESPOND_ALL_OPS: u8 = 1 << 7;
}

pub mod info3 {
    /// Last group of a multi-message response.
    pub const LAST: u8 = 1 << 0;
    pub const COMMIT_MASTER: u8 = 1 << 1;
    pub const UPDATE_ONLY: u8 = 1 << 3;
}

pub mod info4 {
    pub const MRT_VERIFY_READ: u8 = 1 << 0;
    pub const MRT_ROLL_FORWARD: u8 = 1 << 1;
    pub const MRT_ROLL_BACK: u8 = 1 << 2;
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Namespace = 0,
    SetName = 1,
    Key = 2,
    RecordVersion = 3,
    Digest = 4,
    MrtId = 5,
    MrtDeadline = 6,
    TaskId = 7,
    ScanOptions = 8,
    ScanTimeout = 9,
    PidArray = 11,
    DigestArray = 12,
    MaxRecords = 13,
    UdfPackageName = 30,
    UdfFunction = 31,
    UdfArgList = 32,
    UdfOp = 33,
    QueryBins = 40,
    BatchIndex = 41,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpType {
    Read = 1,
    Write = 2,
    CdtRead = 3,
    CdtModify = 4,
    Incr = 5,
    Append = 9,
    Prepend = 10,
    Touch = 11,
    Delete = 14,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticleType {
    Null = 0,
    Integer = 1,
    Float = 2,
    String = 3,
    Blob = 4,
    Bool = 17,
    Map = 19,
    List = 20,
}

/// Record command message header, the 22 bytes after the proto header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub info4: u8,
    pub result_code: u8,
    pub generation: u32,
    pub record_ttl: u32,
    pub txn_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

impl MessageHeader {
    fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(MSG_HEADER_SIZE as u8)?;
        w.write_u8(self.info1)?;
        w.write_u8(self.info2)?;
        w.write_u8(self.info3)?;
        w.write_u8(self.info4)?;
        w.write_u8(self.result_code)?;
        w.write_u32::<BigEndian>(self.generation)?;
        w.write_u32::<BigEndian>(self.record_ttl)?;
        w.write_u32::<BigEndian>(self.txn_ttl)?;
        w.write_u16::<BigEndian>(self.n_fields)?;
        w.write_u16::<BigEndian>(self.n_ops)
    }

    pub fn parse(buf: &[u8; MSG_HEADER_SIZE]) -> Self {
        Self {
            info1: buf[1],
            info2: buf[2],
            info3: buf[3],
            info4: buf[4],
            result_code: buf[5],
            generation: BigEndian::read_u32(&buf[6..10]),
            record_ttl: BigEndian::read_u32(&buf[10..14]),
            txn_ttl: BigEndian::read_u32(&buf[14..18]),
            n_fields: BigEndian::read_u16(&buf[18..20]),
            n_ops: BigEndian::read_u16(&buf[20..22]),
        }
    }
}

/// Assembles a record command. Fields must all be added before the first
/// operation.
pub struct MessageBuilder {
    header: MessageHeader,
    fields: Vec<u8>,
    ops: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(info1: u8, info2: u8, info3: u8, info4: u8) -> Self {
        Self {
            header: MessageHeader {
                info1,
                info2,
                info3,
                info4,
                ..Default::default()
            },
            fields: Vec::new(),
            ops: Vec::new(),
        }
    }

    pub fn record_ttl(mut self, ttl: u32) -> Self {
        self.header.record_ttl = ttl;
        self
    }

    pub fn txn_ttl(mut self, ttl: u32) -> Self {
        self.header.txn_ttl = ttl;
        self
    }

    pub fn field(mut self, field_type: FieldType, data: &[u8]) -> Self {
        self.fields
            .extend_from_slice(&(data.len() as u32 + 1).to_be_bytes());
        self.fields.push(field_type as u8);
        self.fields.extend_from_slice(data);
        self.header.n_fields += 1;
        self
    }

    pub fn field_u64_le(self, field_type: FieldType, value: u64) -> Self {
        self.field(field_type, &value.to_le_bytes())
    }

    /// Record versions travel as 7 little endian bytes.
    pub fn record_version(self, version: u64) -> Self {
        let bytes = version.to_le_bytes();
        self.field(FieldType::RecordVersion, &bytes[..7])
    }

    pub fn op(
        mut self,
        op_type: OpType,
        particle: ParticleType,
        name: &str,
        value: &[u8],
    ) -> Self {
        let size = 4 + name.len() + value.len();
        self.ops.extend_from_slice(&(size as u32).to_be_bytes());
        self.ops.push(op_type as u8);
        self.ops.push(particle as u8);
        self.ops.push(0);
        self.ops.push(name.len() as u8);
        self.ops.extend_from_slice(name.as_bytes());
        self.ops.extend_from_slice(value);
        self.header.n_ops += 1;
        self
    }

    /// Returns the complete frame including the proto header.
    pub fn build(self) -> Vec<u8> {
        let body = MSG_HEADER_SIZE + self.fields.len() + self.ops.len();
        let mut buf = Vec::with_capacity(PROTO_HEADER_SIZE + body);
        buf.extend_from_slice(&ProtoHeader::new(MessageType::Message, body).to_bytes());
        // writes into a Vec can't fail
        let _ = self.header.write(&mut buf);
        buf.extend_from_slice(&self.fields);
        buf.extend_from_slice(&self.ops);
        buf
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub field_type: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    pub op_type: u8,
    pub particle: u8,
    pub name: String,
    pub value: Vec<u8>,
}

/// A decoded record command or response body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub fields: Vec<Field>,
    pub ops: Vec<Op>,
}

/// Bytes left after the cursor. Sizes read off the wire are checked against
/// this before anything is allocated.
fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len().saturating_sub(cursor.position() as usize)
}

impl Message {
    /// Parses one message from the start of `body`, returning it with the
    /// number of bytes consumed.
    pub fn parse(body: &[u8]) -> Result<(Self, usize)> {
        if body.len() < MSG_HEADER_SIZE {
            Err(parse_error("message header"))?
        }
        let header = MessageHeader::parse(array_ref![body, 0, MSG_HEADER_SIZE]);
        let mut cursor = Cursor::new(&body[MSG_HEADER_SIZE..]);
        let mut fields = Vec::with_capacity(header.n_fields as usize);
        for _ in 0..header.n_fields {
            let size = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| parse_error("field size"))? as usize;
            if size == 0 {
                Err(parse_error("field size"))?
            }
            let field_type = cursor.read_u8().map_err(|_| parse_error("field type"))?;
            if size - 1 > remaining(&cursor) {
                Err(parse_error("field size"))?
            }
            let mut data = vec![0u8; size - 1];
            cursor
                .read_exact(&mut data)
                .map_err(|_| parse_error("field data"))?;
            fields.push(Field { field_type, data });
        }
        let mut ops = Vec::with_capacity(header.n_ops as usize);
        for _ in 0..header.n_ops {
            let size = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| parse_error("op size"))? as usize;
            let mut head = [0u8; 4];
            cursor
                .read_exact(&mut head)
                .map_err(|_| parse_error("op header"))?;
            let name_len = head[3] as usize;
            if size < 4 + name_len || size - 4 > remaining(&cursor) {
                Err(parse_error("op size"))?
            }
            let mut name = vec![0u8; name_len];
            cursor.read_exact(&mut name).map_err(|_| parse_error("op name"))?;
            let mut value = vec![0u8; size - 4 - name_len];
            cursor
                .read_exact(&mut value)
                .map_err(|_| parse_error("op value"))?;
            ops.push(Op {
                op_type: head[0],
                particle: head[1],
                name: String::from_utf8_lossy(&name).into_owned(),
                value,
            });
        }
        let consumed = MSG_HEADER_SIZE + cursor.position() as usize;
        Ok((
            Self {
                header,
                fields,
                ops,
            },
            consumed,
        ))
    }

    pub fn result_code(&self) -> ResultCode {
        ResultCode::from_server(self.header.result_code)
    }

    pub fn field(&self, field_type: FieldType) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|f| f.field_type == field_type as u8)
            .map(|f| f.data.as_slice())
    }

    /// Record version returned by the server, when present.
    pub fn record_version(&self) -> Option<u64> {
        self.field(FieldType::RecordVersion)
            .filter(|data| data.len() == 7)
            .map(|data| LittleEndian::read_uint(data, 7))
    }

    pub fn mrt_deadline(&self) -> Option<u32> {
        self.field(FieldType::MrtDeadline)
            .filter(|data| data.len() == 4)
            .map(LittleEndian::read_u32)
    }

    pub fn op(&self, name: &str) -> Option<&Op> {
        self.ops.iter().find(|op| op.name == name)
    }
}

#[track_caller]
fn parse_error(what: &str) -> Error {
    Error::new(ResultCode::Client, format!("Failed to parse {}", what))
}
