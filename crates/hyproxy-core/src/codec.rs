//! Descriptor-driven payload codec.
//!
//! Every packet kind is described by a [`Schema`]: an ordered list of
//! [`Field`]s. One engine interprets the descriptors for encode, decode and
//! validation. Payload layout:
//!
//! ```text
//! [nullable bitmask][fixed fields][i32 LE offset per variable field][variable section]
//! ```
//!
//! - The bitmask has one bit per optional field, in declaration order, and
//!   is omitted when the schema has no optional fields.
//! - Absent optional fixed fields are written as zeros.
//! - Offsets are relative to the start of the variable section; `-1` marks
//!   an absent field.
//! - Collections are prefixed by a VarInt count and their elements are
//!   written back to back, each by its own rule.

use crate::error::{ProtocolError, ProtocolResult};
use crate::varint;
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

/// Wire type of a single field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Bool,
    U8,
    I16,
    I32,
    I64,
    F32,
    /// Two big-endian i64 halves.
    Uuid,
    /// Zero-padded ASCII of exactly this many bytes.
    FixedAscii(usize),
    /// One byte indexing into the value table.
    Enum(&'static [&'static str]),
    String {
        max: usize,
        ascii: bool,
    },
    Bytes {
        max: usize,
    },
    Array {
        elem: &'static FieldKind,
        max: usize,
    },
    Map {
        key: &'static FieldKind,
        value: &'static FieldKind,
        max: usize,
    },
    Struct(&'static Schema),
}

impl FieldKind {
    /// Size in the fixed block, or `None` for variable-length kinds.
    pub const fn fixed_size(&self) -> Option<usize> {
        match self {
            FieldKind::Bool | FieldKind::U8 | FieldKind::Enum(_) => Some(1),
            FieldKind::I16 => Some(2),
            FieldKind::I32 | FieldKind::F32 => Some(4),
            FieldKind::I64 => Some(8),
            FieldKind::Uuid => Some(16),
            FieldKind::FixedAscii(n) => Some(*n),
            _ => None,
        }
    }

    pub const fn is_variable(&self) -> bool {
        self.fixed_size().is_none()
    }
}

/// A named field in a schema.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub optional: bool,
}

/// Declarative layout of one record type.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub name: &'static str,
    pub fields: &'static [Field],
}

impl Schema {
    pub fn optional_count(&self) -> usize {
        self.fields.iter().filter(|f| f.optional).count()
    }

    pub fn null_bits_len(&self) -> usize {
        self.optional_count().div_ceil(8)
    }

    /// Bitmask plus all fixed-size fields.
    pub fn fixed_block_size(&self) -> usize {
        self.null_bits_len()
            + self
                .fields
                .iter()
                .filter_map(|f| f.kind.fixed_size())
                .sum::<usize>()
    }

    pub fn variable_count(&self) -> usize {
        self.fields.iter().filter(|f| f.kind.is_variable()).count()
    }

    /// Offset of the variable section from the start of the record.
    pub fn variable_block_start(&self) -> usize {
        self.fixed_block_size() + 4 * self.variable_count()
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    Uuid(Uuid),
    Str(String),
    Enum(u8),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Struct(Vec<Option<Value>>),
}

/// A Rust type with a schema, convertible to and from positional values.
pub trait Record: Sized {
    const SCHEMA: Schema;

    fn to_values(&self) -> Vec<Option<Value>>;

    fn from_values(values: Vec<Option<Value>>) -> ProtocolResult<Self>;

    fn encode(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        encode_record(&Self::SCHEMA, &self.to_values(), buf)
    }

    /// Decode from `data`, returning the record and the bytes it spans.
    fn decode(data: &[u8]) -> ProtocolResult<(Self, usize)> {
        let (values, consumed) = decode_record(&Self::SCHEMA, data, 0)?;
        Ok((Self::from_values(values)?, consumed))
    }
}

/// Conversion between a Rust field type and a [`Value`].
pub trait FieldValue: Sized {
    fn into_value(self) -> Value;
    fn from_value(value: Value, field: &'static str) -> ProtocolResult<Self>;
}

macro_rules! scalar_field_value {
    ($ty:ty, $variant:ident) => {
        impl FieldValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
            fn from_value(value: Value, field: &'static str) -> ProtocolResult<Self> {
                match value {
                    Value::$variant(v) => Ok(v),
                    _ => Err(ProtocolError::TypeMismatch { field }),
                }
            }
        }
    };
}

scalar_field_value!(bool, Bool);
scalar_field_value!(u8, U8);
scalar_field_value!(i16, I16);
scalar_field_value!(i32, I32);
scalar_field_value!(i64, I64);
scalar_field_value!(f32, F32);
scalar_field_value!(Uuid, Uuid);
scalar_field_value!(String, Str);
scalar_field_value!(Vec<u8>, Bytes);

// `Vec<u8>` is the byte-array kind, so element arrays are implemented per type.
macro_rules! array_field_value {
    ($($ty:ty),*) => {
        $(
            impl FieldValue for Vec<$ty> {
                fn into_value(self) -> Value {
                    Value::Array(self.into_iter().map(FieldValue::into_value).collect())
                }

                fn from_value(value: Value, field: &'static str) -> ProtocolResult<Self> {
                    match value {
                        Value::Array(items) => items
                            .into_iter()
                            .map(|v| <$ty>::from_value(v, field))
                            .collect(),
                        _ => Err(ProtocolError::TypeMismatch { field }),
                    }
                }
            }
        )*
    };
}

array_field_value!(bool, i16, i32, i64, f32, Uuid, String);

// ── Encode ──────────────────────────────────────────────────────────

/// Encode positional `values` according to `schema`, appending to `buf`.
pub fn encode_record(
    schema: &Schema,
    values: &[Option<Value>],
    buf: &mut BytesMut,
) -> ProtocolResult<()> {
    if values.len() != schema.fields.len() {
        return Err(ProtocolError::TypeMismatch { field: schema.name });
    }

    let mut null_bits = vec![0u8; schema.null_bits_len()];
    let mut bit = 0;
    for (field, value) in schema.fields.iter().zip(values) {
        if field.optional {
            if value.is_some() {
                null_bits[bit / 8] |= 1 << (bit % 8);
            }
            bit += 1;
        } else if value.is_none() {
            return Err(ProtocolError::MissingField { field: field.name });
        }
    }
    buf.put_slice(&null_bits);

    for (field, value) in schema.fields.iter().zip(values) {
        if let Some(size) = field.kind.fixed_size() {
            match value {
                Some(v) => write_value(&field.kind, v, field.name, buf)?,
                None => buf.put_bytes(0, size),
            }
        }
    }

    let mut slots = Vec::with_capacity(schema.variable_count());
    for field in schema.fields.iter().filter(|f| f.kind.is_variable()) {
        slots.push((field, buf.len()));
        buf.put_i32_le(0);
    }

    let var_start = buf.len();
    let mut var_values = schema
        .fields
        .iter()
        .zip(values)
        .filter(|(f, _)| f.kind.is_variable())
        .map(|(_, v)| v);
    for (field, slot) in slots {
        let offset = match var_values.next().and_then(Option::as_ref) {
            Some(v) => {
                let offset = (buf.len() - var_start) as i32;
                write_value(&field.kind, v, field.name, buf)?;
                offset
            }
            None => -1,
        };
        buf[slot..slot + 4].copy_from_slice(&offset.to_le_bytes());
    }

    Ok(())
}

fn write_value(
    kind: &FieldKind,
    value: &Value,
    field: &'static str,
    buf: &mut BytesMut,
) -> ProtocolResult<()> {
    match (kind, value) {
        (FieldKind::Bool, Value::Bool(b)) => buf.put_u8(*b as u8),
        (FieldKind::U8, Value::U8(v)) => buf.put_u8(*v),
        (FieldKind::I16, Value::I16(v)) => buf.put_i16_le(*v),
        (FieldKind::I32, Value::I32(v)) => buf.put_i32_le(*v),
        (FieldKind::I64, Value::I64(v)) => buf.put_i64_le(*v),
        (FieldKind::F32, Value::F32(v)) => buf.put_f32_le(*v),
        (FieldKind::Uuid, Value::Uuid(u)) => buf.put_slice(&u.as_u128().to_be_bytes()),
        (FieldKind::FixedAscii(n), Value::Str(s)) => {
            if !s.is_ascii() {
                return Err(ProtocolError::InvalidString { field });
            }
            if s.len() > *n {
                return Err(ProtocolError::StringTooLong {
                    field,
                    len: s.len(),
                    max: *n,
                });
            }
            buf.put_slice(s.as_bytes());
            buf.put_bytes(0, n - s.len());
        }
        (FieldKind::Enum(table), Value::Enum(idx)) => {
            if *idx as usize >= table.len() {
                return Err(ProtocolError::InvalidEnum { field, index: *idx });
            }
            buf.put_u8(*idx);
        }
        (FieldKind::String { max, ascii }, Value::Str(s)) => {
            if *ascii && !s.is_ascii() {
                return Err(ProtocolError::InvalidString { field });
            }
            if s.len() > *max {
                return Err(ProtocolError::StringTooLong {
                    field,
                    len: s.len(),
                    max: *max,
                });
            }
            varint::write(buf, s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
        (FieldKind::Bytes { max }, Value::Bytes(b)) => {
            check_count(field, b.len(), *max)?;
            varint::write(buf, b.len() as i32);
            buf.put_slice(b);
        }
        (FieldKind::Array { elem, max }, Value::Array(items)) => {
            check_count(field, items.len(), *max)?;
            varint::write(buf, items.len() as i32);
            for item in items {
                write_value(elem, item, field, buf)?;
            }
        }
        (FieldKind::Map { key, value, max }, Value::Map(entries)) => {
            check_count(field, entries.len(), *max)?;
            for (i, (k, _)) in entries.iter().enumerate() {
                if entries[..i].iter().any(|(other, _)| other == k) {
                    return Err(ProtocolError::DuplicateMapKey { field });
                }
            }
            varint::write(buf, entries.len() as i32);
            for (k, v) in entries {
                write_value(key, k, field, buf)?;
                write_value(value, v, field, buf)?;
            }
        }
        (FieldKind::Struct(schema), Value::Struct(values)) => encode_record(schema, values, buf)?,
        _ => return Err(ProtocolError::TypeMismatch { field }),
    }
    Ok(())
}

fn check_count(field: &'static str, len: usize, max: usize) -> ProtocolResult<()> {
    if len > max {
        return Err(ProtocolError::ArrayTooLong { field, len, max });
    }
    Ok(())
}

// ── Decode ──────────────────────────────────────────────────────────

/// Decode one record starting at `offset`.
///
/// Returns the positional values and the number of bytes the record spans
/// (the furthest byte touched by any field).
pub fn decode_record(
    schema: &Schema,
    data: &[u8],
    offset: usize,
) -> ProtocolResult<(Vec<Option<Value>>, usize)> {
    let var_block_start = schema.variable_block_start();
    ensure(schema.name, data, offset, var_block_start)?;

    let null_bits = &data[offset..offset + schema.null_bits_len()];
    let mut present = Vec::with_capacity(schema.fields.len());
    let mut bit = 0;
    for field in schema.fields {
        if field.optional {
            present.push(null_bits[bit / 8] & (1 << (bit % 8)) != 0);
            bit += 1;
        } else {
            present.push(true);
        }
    }

    let mut values: Vec<Option<Value>> = vec![None; schema.fields.len()];
    let mut pos = offset + schema.null_bits_len();
    for (i, field) in schema.fields.iter().enumerate() {
        if let Some(size) = field.kind.fixed_size() {
            if present[i] {
                let (value, _) = read_value(&field.kind, data, pos, field.name)?;
                values[i] = Some(value);
            }
            pos += size;
        }
    }

    let var_start = offset + var_block_start;
    let mut max_end = var_block_start;
    for (i, field) in schema.fields.iter().enumerate() {
        if !field.kind.is_variable() {
            continue;
        }
        let slot = read_i32(data, pos);
        pos += 4;
        if !present[i] {
            continue;
        }
        if slot < 0 {
            if field.optional {
                return Err(ProtocolError::InvalidOffset {
                    field: field.name,
                    offset: slot,
                });
            }
            return Err(ProtocolError::MissingField { field: field.name });
        }
        let field_pos = var_start + slot as usize;
        if field_pos > data.len() {
            return Err(ProtocolError::InvalidOffset {
                field: field.name,
                offset: slot,
            });
        }
        let (value, consumed) = read_value(&field.kind, data, field_pos, field.name)?;
        values[i] = Some(value);
        max_end = max_end.max(field_pos + consumed - offset);
    }

    Ok((values, max_end))
}

/// Apply every structural check of [`decode_record`] to a payload and return
/// the number of bytes the record spans.
pub fn validate_record(schema: &Schema, data: &[u8]) -> ProtocolResult<usize> {
    decode_record(schema, data, 0).map(|(_, consumed)| consumed)
}

fn read_value(
    kind: &FieldKind,
    data: &[u8],
    pos: usize,
    field: &'static str,
) -> ProtocolResult<(Value, usize)> {
    if let Some(size) = kind.fixed_size() {
        ensure(field, data, pos, size)?;
    }
    let value = match kind {
        FieldKind::Bool => (Value::Bool(data[pos] != 0), 1),
        FieldKind::U8 => (Value::U8(data[pos]), 1),
        FieldKind::I16 => (
            Value::I16(i16::from_le_bytes([data[pos], data[pos + 1]])),
            2,
        ),
        FieldKind::I32 => (Value::I32(read_i32(data, pos)), 4),
        FieldKind::I64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[pos..pos + 8]);
            (Value::I64(i64::from_le_bytes(raw)), 8)
        }
        FieldKind::F32 => (Value::F32(f32::from_bits(read_i32(data, pos) as u32)), 4),
        FieldKind::Uuid => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&data[pos..pos + 16]);
            (Value::Uuid(Uuid::from_u128(u128::from_be_bytes(raw))), 16)
        }
        FieldKind::FixedAscii(n) => {
            let raw = &data[pos..pos + n];
            let end = raw.iter().position(|b| *b == 0).unwrap_or(*n);
            if !raw[..end].is_ascii() {
                return Err(ProtocolError::InvalidString { field });
            }
            let s = String::from_utf8(raw[..end].to_vec())
                .map_err(|_| ProtocolError::InvalidString { field })?;
            (Value::Str(s), *n)
        }
        FieldKind::Enum(table) => {
            let index = data[pos];
            if index as usize >= table.len() {
                return Err(ProtocolError::InvalidEnum { field, index });
            }
            (Value::Enum(index), 1)
        }
        FieldKind::String { max, ascii } => {
            let (len, header) = read_len(data, pos, field)?;
            if len > *max {
                return Err(ProtocolError::StringTooLong { field, len, max: *max });
            }
            let start = pos + header;
            ensure(field, data, start, len)?;
            let raw = &data[start..start + len];
            if *ascii && !raw.is_ascii() {
                return Err(ProtocolError::InvalidString { field });
            }
            let s = std::str::from_utf8(raw)
                .map_err(|_| ProtocolError::InvalidString { field })?
                .to_string();
            (Value::Str(s), header + len)
        }
        FieldKind::Bytes { max } => {
            let (len, header) = read_len(data, pos, field)?;
            check_count(field, len, *max)?;
            let start = pos + header;
            ensure(field, data, start, len)?;
            (Value::Bytes(data[start..start + len].to_vec()), header + len)
        }
        FieldKind::Array { elem, max } => {
            let (count, header) = read_len(data, pos, field)?;
            check_count(field, count, *max)?;
            if let Some(size) = elem.fixed_size() {
                ensure(field, data, pos + header, count * size)?;
            }
            let mut cursor = pos + header;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let (item, used) = read_value(elem, data, cursor, field)?;
                items.push(item);
                cursor += used;
            }
            (Value::Array(items), cursor - pos)
        }
        FieldKind::Map { key, value, max } => {
            let (count, header) = read_len(data, pos, field)?;
            check_count(field, count, *max)?;
            let mut cursor = pos + header;
            let mut entries: Vec<(Value, Value)> = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let (k, used) = read_value(key, data, cursor, field)?;
                cursor += used;
                if entries.iter().any(|(existing, _)| *existing == k) {
                    return Err(ProtocolError::DuplicateMapKey { field });
                }
                let (v, used) = read_value(value, data, cursor, field)?;
                cursor += used;
                entries.push((k, v));
            }
            (Value::Map(entries), cursor - pos)
        }
        FieldKind::Struct(schema) => {
            let (values, consumed) = decode_record(schema, data, pos)?;
            (Value::Struct(values), consumed)
        }
    };
    Ok(value)
}

fn read_len(data: &[u8], pos: usize, field: &'static str) -> ProtocolResult<(usize, usize)> {
    let (len, header) = varint::read(data, pos, field)?;
    if len < 0 {
        return Err(ProtocolError::NegativeLength {
            field,
            len: len as i64,
        });
    }
    Ok((len as usize, header))
}

fn read_i32(data: &[u8], pos: usize) -> i32 {
    i32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

fn ensure(field: &'static str, data: &[u8], pos: usize, len: usize) -> ProtocolResult<()> {
    let needed = pos.saturating_add(len);
    if needed > data.len() {
        return Err(ProtocolError::BufferTooSmall {
            field,
            needed,
            available: data.len(),
        });
    }
    Ok(())
}

// ── Declaration macros ──────────────────────────────────────────────

/// Declare a record struct together with its [`Schema`] and value conversions.
///
/// Each field is `name: required|optional Type => FieldKind`.
#[macro_export]
macro_rules! schema_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $presence:ident $ty:ty => $kind:expr ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default)]
        $vis struct $name {
            $( $(#[$fmeta])* pub $field: $crate::__schema_field_ty!($presence $ty), )*
        }

        impl $crate::codec::Record for $name {
            const SCHEMA: $crate::codec::Schema = $crate::codec::Schema {
                name: stringify!($name),
                fields: &[
                    $( $crate::codec::Field {
                        name: stringify!($field),
                        kind: $kind,
                        optional: $crate::__schema_field_optional!($presence),
                    }, )*
                ],
            };

            fn to_values(&self) -> Vec<Option<$crate::codec::Value>> {
                vec![ $( $crate::__schema_field_into!($presence self.$field), )* ]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(
                values: Vec<Option<$crate::codec::Value>>,
            ) -> $crate::error::ProtocolResult<Self> {
                let mut values = values.into_iter();
                Ok(Self {
                    $( $field: $crate::__schema_field_from!(
                        $presence $ty, values.next().flatten(), stringify!($field)
                    ), )*
                })
            }
        }

        impl $crate::codec::FieldValue for $name {
            fn into_value(self) -> $crate::codec::Value {
                $crate::codec::Value::Struct($crate::codec::Record::to_values(&self))
            }

            fn from_value(
                value: $crate::codec::Value,
                field: &'static str,
            ) -> $crate::error::ProtocolResult<Self> {
                match value {
                    $crate::codec::Value::Struct(values) => {
                        <Self as $crate::codec::Record>::from_values(values)
                    }
                    _ => Err($crate::error::ProtocolError::TypeMismatch { field }),
                }
            }
        }
    };
}

/// Declare a one-byte enum with its value table.
#[macro_export]
macro_rules! schema_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident { $first:ident $(, $variant:ident)* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        $vis enum $name {
            #[default]
            $first,
            $( $variant, )*
        }

        impl $name {
            pub const VALUES: &'static [&'static str] =
                &[stringify!($first) $(, stringify!($variant))*];

            pub fn from_index(index: u8) -> Option<Self> {
                const ALL: &[$name] = &[$name::$first $(, $name::$variant)*];
                ALL.get(index as usize).copied()
            }

            pub const fn kind() -> $crate::codec::FieldKind {
                $crate::codec::FieldKind::Enum(Self::VALUES)
            }
        }

        impl $crate::codec::FieldValue for $name {
            fn into_value(self) -> $crate::codec::Value {
                $crate::codec::Value::Enum(self as u8)
            }

            fn from_value(
                value: $crate::codec::Value,
                field: &'static str,
            ) -> $crate::error::ProtocolResult<Self> {
                match value {
                    $crate::codec::Value::Enum(index) => Self::from_index(index)
                        .ok_or($crate::error::ProtocolError::InvalidEnum { field, index }),
                    _ => Err($crate::error::ProtocolError::TypeMismatch { field }),
                }
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __schema_field_ty {
    (required $ty:ty) => { $ty };
    (optional $ty:ty) => { Option<$ty> };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __schema_field_optional {
    (required) => {
        false
    };
    (optional) => {
        true
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __schema_field_into {
    (required $e:expr) => {
        Some($crate::codec::FieldValue::into_value($e.clone()))
    };
    (optional $e:expr) => {
        $e.clone().map($crate::codec::FieldValue::into_value)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __schema_field_from {
    (required $ty:ty, $v:expr, $name:expr) => {
        <$ty as $crate::codec::FieldValue>::from_value(
            $v.ok_or($crate::error::ProtocolError::MissingField { field: $name })?,
            $name,
        )?
    };
    (optional $ty:ty, $v:expr, $name:expr) => {
        match $v {
            Some(value) => Some(<$ty as $crate::codec::FieldValue>::from_value(value, $name)?),
            None => None,
        }
    };
}
