//! Typed values: the tagged byte-buffer ABI.
//!
//! A [`TValue`] is {tag, bytes}. Inside a table entry the same pair is
//! stored with the tag in a separate field ahead of the payload, so key
//! ordering is deterministic: tag first, then the raw bytes
//! lexicographically — keys with different tags never compare equal.
//!
//! Conventions carried across the boundary:
//! - strings are stored with their NUL terminator included;
//! - numbers are IEEE 754 doubles, integers are 64-bit signed;
//! - booleans are one byte;
//! - table values hold an 8-byte handle (the table's arena offset).

use std::cmp::Ordering;

use shtab_util::status::{Result, Status};

/// Value tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Nil = 0,
    String = 1,
    Number = 2,
    Boolean = 3,
    Integer = 4,
    U64 = 5,
    Table = 6,
}

impl Tag {
    /// Decode a stored tag byte.
    pub fn from_u8(b: u8) -> Result<Tag> {
        match b {
            0 => Ok(Tag::Nil),
            1 => Ok(Tag::String),
            2 => Ok(Tag::Number),
            3 => Ok(Tag::Boolean),
            4 => Ok(Tag::Integer),
            5 => Ok(Tag::U64),
            6 => Ok(Tag::Table),
            other => Err(Status::Unsupported(other)),
        }
    }

    #[inline]
    pub fn is_table(self) -> bool {
        self == Tag::Table
    }
}

/// Opaque handle of a table inside the arena.
///
/// Handles are only meaningful to the [`crate::Store`] that produced them;
/// they are byte offsets into its shared segment, never raw addresses, so
/// they stay valid across processes mapping the segment at different
/// bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(pub(crate) u64);

impl TableId {
    #[inline]
    pub(crate) fn off(self) -> u64 {
        self.0
    }
}

/// Starting-position selector for iterators; applies to the init key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterSide {
    /// Start exactly at the key; `NotFound` when absent.
    Eq,
    /// Start at the greatest entry `<=` the key.
    LeftEq,
    /// Start at the smallest entry `>=` the key.
    RightEq,
}

/// A tagged, owned value crossing the store boundary.
///
/// The buffer is owned by the value; `get` and iterator results are fresh
/// copies. A table-typed value additionally acts as a *reference*: the
/// store pins it in the calling process's root table until
/// [`crate::Store::free_value`] releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TValue {
    tag: Tag,
    bytes: Box<[u8]>,
}

impl TValue {
    pub fn nil() -> Self {
        Self {
            tag: Tag::Nil,
            bytes: Box::new([]),
        }
    }

    /// A string value; the stored bytes include the NUL terminator.
    pub fn from_str(s: &str) -> Result<Self> {
        if s.as_bytes().contains(&0) {
            return Err(Status::ArgInvalid("string contains interior NUL"));
        }
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        Ok(Self {
            tag: Tag::String,
            bytes: bytes.into_boxed_slice(),
        })
    }

    pub fn from_f64(v: f64) -> Self {
        Self {
            tag: Tag::Number,
            bytes: Box::new(v.to_le_bytes()),
        }
    }

    pub fn from_bool(v: bool) -> Self {
        Self {
            tag: Tag::Boolean,
            bytes: Box::new([v as u8]),
        }
    }

    pub fn from_i64(v: i64) -> Self {
        Self {
            tag: Tag::Integer,
            bytes: Box::new(v.to_le_bytes()),
        }
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            tag: Tag::U64,
            bytes: Box::new(v.to_le_bytes()),
        }
    }

    pub(crate) fn from_table(id: TableId) -> Self {
        Self {
            tag: Tag::Table,
            bytes: Box::new(id.0.to_le_bytes()),
        }
    }

    /// Rebuild a value from stored entry bytes.
    pub(crate) fn from_raw(tag: Tag, bytes: &[u8]) -> Self {
        Self {
            tag,
            bytes: bytes.to_vec().into_boxed_slice(),
        }
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        self.tag == Tag::Nil
    }

    /// The string payload without its terminator.
    pub fn as_str(&self) -> Result<&str> {
        if self.tag != Tag::String {
            return Err(Status::Unsupported(self.tag as u8));
        }
        let raw = self
            .bytes
            .split_last()
            .filter(|(nul, _)| **nul == 0)
            .map(|(_, body)| body)
            .ok_or(Status::StateInvalid("string payload lacks terminator"))?;
        std::str::from_utf8(raw).map_err(|_| Status::StateInvalid("string payload is not UTF-8"))
    }

    pub fn as_f64(&self) -> Result<f64> {
        if self.tag != Tag::Number {
            return Err(Status::Unsupported(self.tag as u8));
        }
        Ok(f64::from_le_bytes(self.fixed()?))
    }

    pub fn as_bool(&self) -> Result<bool> {
        if self.tag != Tag::Boolean {
            return Err(Status::Unsupported(self.tag as u8));
        }
        match self.bytes.first() {
            Some(b) => Ok(*b != 0),
            None => Err(Status::StateInvalid("empty boolean payload")),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        if self.tag != Tag::Integer {
            return Err(Status::Unsupported(self.tag as u8));
        }
        Ok(i64::from_le_bytes(self.fixed()?))
    }

    pub fn as_u64(&self) -> Result<u64> {
        if self.tag != Tag::U64 {
            return Err(Status::Unsupported(self.tag as u8));
        }
        Ok(u64::from_le_bytes(self.fixed()?))
    }

    /// The table handle carried by a table-typed value.
    pub fn table_id(&self) -> Result<TableId> {
        if self.tag != Tag::Table {
            return Err(Status::Unsupported(self.tag as u8));
        }
        Ok(TableId(u64::from_le_bytes(self.fixed()?)))
    }

    fn fixed<const N: usize>(&self) -> Result<[u8; N]> {
        self.bytes
            .as_ref()
            .try_into()
            .map_err(|_| Status::StateInvalid("payload length mismatch"))
    }

    /// Key used to pin table references in the per-process root: the
    /// address of this value's owned buffer, unique while the value lives.
    pub(crate) fn ref_key(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }

    /// Replace the payload with nil, releasing the buffer.
    pub(crate) fn clear(&mut self) {
        *self = TValue::nil();
    }
}

/// Ordering of stored keys: tag is the major key, then the raw bytes.
pub(crate) fn cmp_tagged(a_tag: u8, a: &[u8], b_tag: u8, b: &[u8]) -> Ordering {
    a_tag.cmp(&b_tag).then_with(|| a.cmp(b))
}
