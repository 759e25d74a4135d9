//! Native struct layouts.
//!
//! Each struct crossing the backend boundary is declared once with
//! [`native_struct!`], which emits both the `#[repr(C)]` Rust struct and a
//! [`StructDef`] field table. Offsets for any [`Abi`] are computed from the
//! table by `const fn`s; for the host ABI they are checked against
//! `offset_of!`/`size_of` at compile time, so a drifted table does not build.
//!
//! Both bindings pack parameter blocks through [`StructWriter`] over these
//! tables. The direct binding hands the packed bytes to the native call as
//! a struct pointer; the sandboxed binding copies them into the sandbox's
//! linear memory.

use crate::error::MarshalError;
use common::OptionalValue;

/// Target the bytes are laid out for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    /// Current process: native pointer width and byte order
    Host,
    /// wasm32 sandbox: 4-byte pointers, little-endian
    Wasm32,
}

impl Abi {
    pub const fn pointer_bytes(self) -> usize {
        match self {
            Abi::Host => std::mem::size_of::<usize>(),
            Abi::Wasm32 => 4,
        }
    }
}

/// Primitive shape of a field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    Bool,
    I32,
    U32,
    F32,
    OptBool,
    OptI32,
    OptU32,
    OptF32,
    /// Pointer (string, array, or struct); width depends on the ABI
    Ptr,
    Struct(&'static StructDef),
}

impl FieldKind {
    pub const fn size(self, abi: Abi) -> usize {
        match self {
            FieldKind::Bool => 1,
            FieldKind::I32 | FieldKind::U32 | FieldKind::F32 => 4,
            // Every optional occupies a full 8-byte slot
            FieldKind::OptBool | FieldKind::OptI32 | FieldKind::OptU32 | FieldKind::OptF32 => 8,
            FieldKind::Ptr => abi.pointer_bytes(),
            FieldKind::Struct(def) => def.size(abi),
        }
    }

    pub const fn align(self, abi: Abi) -> usize {
        match self {
            FieldKind::Bool => 1,
            FieldKind::I32 | FieldKind::U32 | FieldKind::F32 => 4,
            FieldKind::OptBool | FieldKind::OptI32 | FieldKind::OptU32 | FieldKind::OptF32 => 8,
            FieldKind::Ptr => abi.pointer_bytes(),
            FieldKind::Struct(def) => def.align(abi),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::I32 => "i32",
            FieldKind::U32 => "u32",
            FieldKind::F32 => "f32",
            FieldKind::OptBool => "optional bool",
            FieldKind::OptI32 => "optional i32",
            FieldKind::OptU32 => "optional u32",
            FieldKind::OptF32 => "optional f32",
            FieldKind::Ptr => "pointer",
            FieldKind::Struct(def) => def.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Field table of one native struct, in declaration order.
#[derive(Debug, PartialEq)]
pub struct StructDef {
    pub name: &'static str,
    pub fields: &'static [FieldDef],
}

const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

const fn str_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

impl StructDef {
    pub const fn align(&self, abi: Abi) -> usize {
        let mut align = 1;
        let mut i = 0;
        while i < self.fields.len() {
            let a = self.fields[i].kind.align(abi);
            if a > align {
                align = a;
            }
            i += 1;
        }
        align
    }

    pub const fn size(&self, abi: Abi) -> usize {
        let mut offset = 0;
        let mut i = 0;
        while i < self.fields.len() {
            let kind = self.fields[i].kind;
            offset = align_up(offset, kind.align(abi)) + kind.size(abi);
            i += 1;
        }
        align_up(offset, self.align(abi))
    }

    pub const fn offset_at(&self, index: usize, abi: Abi) -> usize {
        let mut offset = 0;
        let mut i = 0;
        while i < index {
            let kind = self.fields[i].kind;
            offset = align_up(offset, kind.align(abi)) + kind.size(abi);
            i += 1;
        }
        align_up(offset, self.fields[index].kind.align(abi))
    }

    pub const fn offset_of_field(&self, name: &str, abi: Abi) -> Option<usize> {
        let mut i = 0;
        while i < self.fields.len() {
            if str_eq(self.fields[i].name, name) {
                return Some(self.offset_at(i, abi));
            }
            i += 1;
        }
        None
    }

    /// Offset and kind of `name`.
    pub fn locate(&self, name: &str, abi: Abi) -> Result<(usize, FieldKind), MarshalError> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| (self.offset_at(i, abi), self.fields[i].kind))
            .ok_or_else(|| MarshalError::UnknownField {
                structure: self.name,
                field: name.to_string(),
            })
    }

    /// `(name, offset, width)` rows, for diagnostics and sandbox docs.
    pub fn offset_table(&self, abi: Abi) -> Vec<(&'static str, usize, usize)> {
        self.fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name, self.offset_at(i, abi), f.kind.size(abi)))
            .collect()
    }
}

/// Declare a native struct and its field table together.
///
/// ```ignore
/// native_struct! {
///     pub struct EmbeddingParams : EMBEDDING_PARAMS {
///         pub max_embedding_size: u32 => FieldKind::U32,
///     }
/// }
/// ```
macro_rules! native_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident : $def:ident {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty => $kind:expr ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(C)]
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty ),*
        }

        pub const $def: $crate::layout::StructDef = $crate::layout::StructDef {
            name: stringify!($name),
            fields: &[
                $( $crate::layout::FieldDef { name: stringify!($field), kind: $kind } ),*
            ],
        };

        const _: () = {
            use $crate::layout::Abi;
            $(
                assert!(
                    match $def.offset_of_field(stringify!($field), Abi::Host) {
                        Some(offset) => offset == ::std::mem::offset_of!($name, $field),
                        None => false,
                    },
                    concat!("field table drifted: ", stringify!($name), ".", stringify!($field))
                );
            )*
            assert!($def.size(Abi::Host) == ::std::mem::size_of::<$name>());
            assert!($def.align(Abi::Host) == ::std::mem::align_of::<$name>());
        };
    };
}

pub(crate) use native_struct;

/// Value that can be stored in a scalar or optional slot.
pub trait Slot: Sized {
    const KIND: FieldKind;
    fn encode(&self, abi: Abi, out: &mut [u8]);
    fn decode(abi: Abi, bytes: &[u8]) -> Self;
}

fn put_u32(abi: Abi, value: u32, out: &mut [u8]) {
    let bytes = match abi {
        Abi::Host => value.to_ne_bytes(),
        Abi::Wasm32 => value.to_le_bytes(),
    };
    out[..4].copy_from_slice(&bytes);
}

fn get_u32(abi: Abi, bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    match abi {
        Abi::Host => u32::from_ne_bytes(raw),
        Abi::Wasm32 => u32::from_le_bytes(raw),
    }
}

impl Slot for bool {
    const KIND: FieldKind = FieldKind::Bool;
    fn encode(&self, _abi: Abi, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }
    fn decode(_abi: Abi, bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl Slot for u32 {
    const KIND: FieldKind = FieldKind::U32;
    fn encode(&self, abi: Abi, out: &mut [u8]) {
        put_u32(abi, *self, out);
    }
    fn decode(abi: Abi, bytes: &[u8]) -> Self {
        get_u32(abi, bytes)
    }
}

impl Slot for i32 {
    const KIND: FieldKind = FieldKind::I32;
    fn encode(&self, abi: Abi, out: &mut [u8]) {
        put_u32(abi, *self as u32, out);
    }
    fn decode(abi: Abi, bytes: &[u8]) -> Self {
        get_u32(abi, bytes) as i32
    }
}

impl Slot for f32 {
    const KIND: FieldKind = FieldKind::F32;
    fn encode(&self, abi: Abi, out: &mut [u8]) {
        put_u32(abi, self.to_bits(), out);
    }
    fn decode(abi: Abi, bytes: &[u8]) -> Self {
        f32::from_bits(get_u32(abi, bytes))
    }
}

// `has_value` at +0, value at +align_of::<T>()
macro_rules! optional_slot {
    ($t:ty, $kind:expr, $value_offset:expr) => {
        impl Slot for OptionalValue<$t> {
            const KIND: FieldKind = $kind;
            fn encode(&self, abi: Abi, out: &mut [u8]) {
                out[..8].fill(0);
                if let Some(value) = self.get() {
                    out[0] = 1;
                    value.encode(abi, &mut out[$value_offset..]);
                }
            }
            fn decode(abi: Abi, bytes: &[u8]) -> Self {
                if bytes[0] != 0 {
                    OptionalValue::some(<$t>::decode(abi, &bytes[$value_offset..]))
                } else {
                    OptionalValue::none()
                }
            }
        }
    };
}

optional_slot!(bool, FieldKind::OptBool, 1);
optional_slot!(i32, FieldKind::OptI32, 4);
optional_slot!(u32, FieldKind::OptU32, 4);
optional_slot!(f32, FieldKind::OptF32, 4);

/// Zero-initialized, 8-byte-aligned buffer holding one packed struct.
#[derive(Debug, Clone)]
pub struct PackedStruct {
    def: &'static StructDef,
    abi: Abi,
    words: Vec<u64>,
    len: usize,
}

impl PackedStruct {
    pub fn new(def: &'static StructDef, abi: Abi) -> Self {
        let len = def.size(abi);
        Self {
            def,
            abi,
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn def(&self) -> &'static StructDef {
        self.def
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn align(&self) -> usize {
        self.def.align(self.abi)
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `words` owns at least `len` initialized bytes and u8 has
        // no alignment or validity requirements.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`, with unique access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }

    pub fn writer(&mut self) -> StructWriter<'_> {
        let (def, abi) = (self.def, self.abi);
        StructWriter {
            def,
            abi,
            buf: self.bytes_mut(),
        }
    }

    pub fn reader(&self) -> StructReader<'_> {
        StructReader::new(self.def, self.abi, self.bytes())
    }

    /// Pointer to pass where the native side expects `*const T`.
    ///
    /// Only meaningful for [`Abi::Host`] buffers whose table is `T`'s.
    pub fn as_native_ptr<T>(&self) -> *const T {
        debug_assert_eq!(self.abi, Abi::Host);
        debug_assert_eq!(self.len, std::mem::size_of::<T>());
        self.words.as_ptr().cast::<T>()
    }
}

/// Writes fields by name into a packed struct.
pub struct StructWriter<'b> {
    def: &'static StructDef,
    abi: Abi,
    buf: &'b mut [u8],
}

impl<'b> StructWriter<'b> {
    fn slot(&mut self, name: &str, expected: FieldKind) -> Result<&mut [u8], MarshalError> {
        let (offset, kind) = self.def.locate(name, self.abi)?;
        if kind != expected {
            return Err(MarshalError::FieldKind {
                structure: self.def.name,
                field: name.to_string(),
                expected: kind.name(),
                found: expected.name(),
            });
        }
        let end = offset + kind.size(self.abi);
        self.buf
            .get_mut(offset..end)
            .ok_or(MarshalError::OutOfBounds { offset, len: end - offset })
    }

    pub fn set<V: Slot>(&mut self, name: &str, value: V) -> Result<(), MarshalError> {
        let abi = self.abi;
        let out = self.slot(name, V::KIND)?;
        value.encode(abi, out);
        Ok(())
    }

    /// Store an address produced by a [`PointerAllocator`]. `0` is null.
    pub fn set_ptr(&mut self, name: &str, address: u64) -> Result<(), MarshalError> {
        let abi = self.abi;
        let out = self.slot(name, FieldKind::Ptr)?;
        match abi.pointer_bytes() {
            4 => {
                let narrow = u32::try_from(address).map_err(|_| {
                    MarshalError::Allocation(format!("address {:#x} exceeds 32 bits", address))
                })?;
                put_u32(abi, narrow, out);
            }
            _ => {
                let bytes = match abi {
                    Abi::Host => address.to_ne_bytes(),
                    Abi::Wasm32 => address.to_le_bytes(),
                };
                out.copy_from_slice(&bytes[..out.len()]);
            }
        }
        Ok(())
    }

    /// Writer over a nested struct field.
    pub fn nested(&mut self, name: &str) -> Result<StructWriter<'_>, MarshalError> {
        let (offset, kind) = self.def.locate(name, self.abi)?;
        let FieldKind::Struct(def) = kind else {
            return Err(MarshalError::FieldKind {
                structure: self.def.name,
                field: name.to_string(),
                expected: kind.name(),
                found: "struct",
            });
        };
        let end = offset + def.size(self.abi);
        let abi = self.abi;
        let buf = self
            .buf
            .get_mut(offset..end)
            .ok_or(MarshalError::OutOfBounds { offset, len: end - offset })?;
        Ok(StructWriter { def, abi, buf })
    }
}

/// Reads fields by name out of packed bytes.
pub struct StructReader<'b> {
    def: &'static StructDef,
    abi: Abi,
    buf: &'b [u8],
}

impl<'b> StructReader<'b> {
    pub fn new(def: &'static StructDef, abi: Abi, buf: &'b [u8]) -> Self {
        Self { def, abi, buf }
    }

    fn slot(&self, name: &str, expected: FieldKind) -> Result<&'b [u8], MarshalError> {
        let (offset, kind) = self.def.locate(name, self.abi)?;
        if kind != expected {
            return Err(MarshalError::FieldKind {
                structure: self.def.name,
                field: name.to_string(),
                expected: kind.name(),
                found: expected.name(),
            });
        }
        let end = offset + kind.size(self.abi);
        self.buf
            .get(offset..end)
            .ok_or(MarshalError::OutOfBounds { offset, len: end - offset })
    }

    pub fn get<V: Slot>(&self, name: &str) -> Result<V, MarshalError> {
        Ok(V::decode(self.abi, self.slot(name, V::KIND)?))
    }

    pub fn get_ptr(&self, name: &str) -> Result<u64, MarshalError> {
        let bytes = self.slot(name, FieldKind::Ptr)?;
        Ok(match (self.abi, bytes.len()) {
            (abi, 4) => u64::from(get_u32(abi, bytes)),
            (abi, _) => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                match abi {
                    Abi::Host => u64::from_ne_bytes(raw),
                    Abi::Wasm32 => u64::from_le_bytes(raw),
                }
            }
        })
    }

    pub fn nested(&self, name: &str) -> Result<StructReader<'b>, MarshalError> {
        let (offset, kind) = self.def.locate(name, self.abi)?;
        let FieldKind::Struct(def) = kind else {
            return Err(MarshalError::FieldKind {
                structure: self.def.name,
                field: name.to_string(),
                expected: kind.name(),
                found: "struct",
            });
        };
        let end = offset + def.size(self.abi);
        let buf = self
            .buf
            .get(offset..end)
            .ok_or(MarshalError::OutOfBounds { offset, len: end - offset })?;
        Ok(StructReader::new(def, self.abi, buf))
    }
}

/// Places strings and arrays where the backend can read them and returns
/// the address to store in a pointer field.
pub trait PointerAllocator {
    fn abi(&self) -> Abi;

    /// Copy `bytes` into a block aligned to `align`.
    fn alloc(&mut self, bytes: &[u8], align: usize) -> Result<u64, MarshalError>;

    /// NUL-terminated copy of `value`.
    fn alloc_cstr(&mut self, value: &str) -> Result<u64, MarshalError> {
        if value.as_bytes().contains(&0) {
            return Err(MarshalError::InteriorNul(truncate_for_log(value)));
        }
        if value.len() >= MAX_STRING_BYTES {
            return Err(MarshalError::StringTooLong {
                len: value.len(),
                max: MAX_STRING_BYTES,
            });
        }
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.alloc(&bytes, 1)
    }

    /// Packed `i32` array; empty arrays become null.
    fn alloc_i32_array(&mut self, values: &[i32]) -> Result<u64, MarshalError> {
        if values.is_empty() {
            return Ok(0);
        }
        check_array_len(values.len())?;
        let abi = self.abi();
        let mut bytes = vec![0u8; values.len() * 4];
        for (chunk, value) in bytes.chunks_exact_mut(4).zip(values) {
            value.encode(abi, chunk);
        }
        self.alloc(&bytes, 4)
    }

    /// Array of string pointers; empty arrays become null.
    fn alloc_str_array(&mut self, values: &[String]) -> Result<u64, MarshalError> {
        if values.is_empty() {
            return Ok(0);
        }
        check_array_len(values.len())?;
        let abi = self.abi();
        let width = abi.pointer_bytes();
        let mut table = vec![0u8; values.len() * width];
        for (slot, value) in table.chunks_exact_mut(width).zip(values) {
            let address = self.alloc_cstr(value)?;
            match (abi, width) {
                (_, 4) => {
                    let narrow = u32::try_from(address).map_err(|_| {
                        MarshalError::Allocation(format!("address {:#x} exceeds 32 bits", address))
                    })?;
                    put_u32(abi, narrow, slot);
                }
                (Abi::Host, _) => slot.copy_from_slice(&address.to_ne_bytes()[..width]),
                (Abi::Wasm32, _) => slot.copy_from_slice(&address.to_le_bytes()[..width]),
            }
        }
        self.alloc(&table, width)
    }
}

/// Upper bound for a single marshaled string, terminator excluded.
pub const MAX_STRING_BYTES: usize = 64 * 1024 * 1024;

fn check_array_len(len: usize) -> Result<(), MarshalError> {
    if len > i32::MAX as usize {
        return Err(MarshalError::ArrayTooLong { len });
    }
    Ok(())
}

fn truncate_for_log(value: &str) -> String {
    value.chars().take(32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INNER: StructDef = StructDef {
        name: "Inner",
        fields: &[
            FieldDef { name: "flag", kind: FieldKind::Bool },
            FieldDef { name: "count", kind: FieldKind::OptI32 },
        ],
    };

    const OUTER: StructDef = StructDef {
        name: "Outer",
        fields: &[
            FieldDef { name: "text", kind: FieldKind::Ptr },
            FieldDef { name: "small", kind: FieldKind::Bool },
            FieldDef { name: "inner", kind: FieldKind::Struct(&INNER) },
            FieldDef { name: "tail", kind: FieldKind::U32 },
        ],
    };

    #[test]
    fn test_wasm32_offsets() {
        // text@0(4) small@4(1) inner@8(16: flag@0, count@8) tail@24
        assert_eq!(OUTER.offset_of_field("text", Abi::Wasm32), Some(0));
        assert_eq!(OUTER.offset_of_field("small", Abi::Wasm32), Some(4));
        assert_eq!(OUTER.offset_of_field("inner", Abi::Wasm32), Some(8));
        assert_eq!(OUTER.offset_of_field("tail", Abi::Wasm32), Some(24));
        assert_eq!(OUTER.size(Abi::Wasm32), 32);
        assert_eq!(INNER.offset_of_field("count", Abi::Wasm32), Some(8));
    }

    #[test]
    fn test_unknown_field_and_kind_mismatch() {
        let mut packed = PackedStruct::new(&OUTER, Abi::Wasm32);
        let mut writer = packed.writer();
        assert!(matches!(
            writer.set("missing", 1u32),
            Err(MarshalError::UnknownField { .. })
        ));
        assert!(matches!(
            writer.set("tail", 1i32),
            Err(MarshalError::FieldKind { .. })
        ));
        assert!(matches!(writer.nested("tail"), Err(MarshalError::FieldKind { .. })));
    }

    #[test]
    fn test_nested_write_and_read() {
        let mut packed = PackedStruct::new(&OUTER, Abi::Wasm32);
        {
            let mut writer = packed.writer();
            writer.set_ptr("text", 0x1000).unwrap();
            writer.set("tail", 7u32).unwrap();
            let mut inner = writer.nested("inner").unwrap();
            inner.set("flag", true).unwrap();
            inner.set("count", OptionalValue::some(0i32)).unwrap();
        }

        let bytes = packed.bytes();
        assert_eq!(&bytes[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[16], 1, "count presence flag");
        assert_eq!(&bytes[20..24], &0i32.to_le_bytes());

        let reader = packed.reader();
        assert_eq!(reader.get_ptr("text").unwrap(), 0x1000);
        assert_eq!(reader.get::<u32>("tail").unwrap(), 7);
        let inner = reader.nested("inner").unwrap();
        assert_eq!(
            inner.get::<OptionalValue<i32>>("count").unwrap(),
            OptionalValue::some(0)
        );
    }

    #[test]
    fn test_pointer_too_wide_for_sandbox() {
        let mut packed = PackedStruct::new(&OUTER, Abi::Wasm32);
        assert!(matches!(
            packed.writer().set_ptr("text", u64::from(u32::MAX) + 1),
            Err(MarshalError::Allocation(_))
        ));
    }

    #[test]
    fn test_offset_table_lists_every_field() {
        let table = OUTER.offset_table(Abi::Wasm32);
        assert_eq!(
            table,
            vec![("text", 0, 4), ("small", 4, 1), ("inner", 8, 16), ("tail", 24, 4)]
        );
    }
}
