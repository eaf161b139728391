//! FFI type system - C-ABI type descriptors
//!
//! Defines `TypeDescriptor`, a closed description of the scalar and struct
//! types a native function can take or return, together with their ABI size
//! and alignment on the current target.
//!
//! Surface grammar (one tag per scalar, plus a recursive struct form):
//!
//! ```text
//! void u8 i8 u16 i16 u32 i32 u64 i64 float double
//! char uchar short ushort int uint long ulong longdouble
//! struct(<type>, <type>, ...)
//! ```

use crate::error::{FfiError, FfiResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem::{align_of, size_of};
use std::os::raw::{c_char, c_int, c_long, c_short};
use std::str::FromStr;

/// C-ABI type descriptor
///
/// Struct fields are laid out in declaration order with the same padding the
/// platform C compiler inserts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeDescriptor {
    Void,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    Float,
    Double,
    /// Platform `char` (signedness follows the target)
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    /// Platform `long double`
    LongDouble,
    /// Struct over an ordered field list
    Struct(Vec<TypeDescriptor>),
}

/// Every scalar kind, in grammar order
pub const SCALAR_TYPES: [TypeDescriptor; 20] = [
    TypeDescriptor::Void,
    TypeDescriptor::U8,
    TypeDescriptor::I8,
    TypeDescriptor::U16,
    TypeDescriptor::I16,
    TypeDescriptor::U32,
    TypeDescriptor::I32,
    TypeDescriptor::U64,
    TypeDescriptor::I64,
    TypeDescriptor::Float,
    TypeDescriptor::Double,
    TypeDescriptor::Char,
    TypeDescriptor::UChar,
    TypeDescriptor::Short,
    TypeDescriptor::UShort,
    TypeDescriptor::Int,
    TypeDescriptor::UInt,
    TypeDescriptor::Long,
    TypeDescriptor::ULong,
    TypeDescriptor::LongDouble,
];

impl TypeDescriptor {
    /// Build a struct descriptor from its fields
    pub fn structure(fields: impl IntoIterator<Item = TypeDescriptor>) -> Self {
        TypeDescriptor::Struct(fields.into_iter().collect())
    }

    /// Surface grammar tag (`"struct"` for composites)
    pub fn tag(&self) -> &'static str {
        match self {
            TypeDescriptor::Void => "void",
            TypeDescriptor::U8 => "u8",
            TypeDescriptor::I8 => "i8",
            TypeDescriptor::U16 => "u16",
            TypeDescriptor::I16 => "i16",
            TypeDescriptor::U32 => "u32",
            TypeDescriptor::I32 => "i32",
            TypeDescriptor::U64 => "u64",
            TypeDescriptor::I64 => "i64",
            TypeDescriptor::Float => "float",
            TypeDescriptor::Double => "double",
            TypeDescriptor::Char => "char",
            TypeDescriptor::UChar => "uchar",
            TypeDescriptor::Short => "short",
            TypeDescriptor::UShort => "ushort",
            TypeDescriptor::Int => "int",
            TypeDescriptor::UInt => "uint",
            TypeDescriptor::Long => "long",
            TypeDescriptor::ULong => "ulong",
            TypeDescriptor::LongDouble => "longdouble",
            TypeDescriptor::Struct(_) => "struct",
        }
    }

    /// Look up a scalar kind by its grammar tag
    ///
    /// # Examples
    ///
    /// ```
    /// # use atlas_ffi::TypeDescriptor;
    /// assert_eq!(TypeDescriptor::from_tag("i32"), Some(TypeDescriptor::I32));
    /// assert_eq!(TypeDescriptor::from_tag("struct"), None);
    /// ```
    pub fn from_tag(tag: &str) -> Option<Self> {
        SCALAR_TYPES.iter().find(|t| t.tag() == tag).cloned()
    }

    /// ABI size in bytes
    pub fn size_of(&self) -> usize {
        self.layout().0
    }

    /// ABI alignment in bytes
    pub fn align_of(&self) -> usize {
        self.layout().1
    }

    /// Byte offset of every field (empty for scalars)
    pub fn field_offsets(&self) -> Vec<usize> {
        match self {
            TypeDescriptor::Struct(fields) => struct_layout(fields).2,
            _ => Vec::new(),
        }
    }

    /// Struct fields (empty for scalars)
    pub fn fields(&self) -> &[TypeDescriptor] {
        match self {
            TypeDescriptor::Struct(fields) => fields,
            _ => &[],
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeDescriptor::Void)
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, TypeDescriptor::Struct(_))
    }

    /// Integer kinds, including `char`
    pub fn is_integral(&self) -> bool {
        !matches!(
            self,
            TypeDescriptor::Void
                | TypeDescriptor::Float
                | TypeDescriptor::Double
                | TypeDescriptor::LongDouble
                | TypeDescriptor::Struct(_)
        )
    }

    pub fn is_floating(&self) -> bool {
        matches!(
            self,
            TypeDescriptor::Float | TypeDescriptor::Double | TypeDescriptor::LongDouble
        )
    }

    /// Check that the descriptor can cross the ABI adapter as an argument
    pub fn check_argument(&self, index: usize) -> FfiResult<()> {
        if self.is_void() {
            return Err(self.unsupported(format!("argument {}", index), "void is not a value type"));
        }
        self.check_composite(&format!("argument {}", index))
    }

    /// Check that the descriptor can cross the ABI adapter as a return type
    pub fn check_return(&self) -> FfiResult<()> {
        self.check_composite("return type")
    }

    fn check_composite(&self, position: &str) -> FfiResult<()> {
        if let TypeDescriptor::Struct(fields) = self {
            if fields.is_empty() {
                return Err(self.unsupported(position.to_string(), "struct has no fields"));
            }
            for field in fields {
                if field.is_void() {
                    return Err(self.unsupported(position.to_string(), "struct has a void field"));
                }
                field.check_composite(position)?;
            }
        }
        Ok(())
    }

    fn unsupported(&self, position: String, reason: &'static str) -> FfiError {
        FfiError::UnsupportedType {
            ty: self.to_string(),
            position,
            reason,
        }
    }

    fn layout(&self) -> (usize, usize) {
        match self {
            TypeDescriptor::Void => (0, 1),
            TypeDescriptor::U8 | TypeDescriptor::I8 => (1, 1),
            TypeDescriptor::Char | TypeDescriptor::UChar => {
                (size_of::<c_char>(), align_of::<c_char>())
            }
            TypeDescriptor::U16 | TypeDescriptor::I16 => (size_of::<u16>(), align_of::<u16>()),
            TypeDescriptor::Short | TypeDescriptor::UShort => {
                (size_of::<c_short>(), align_of::<c_short>())
            }
            TypeDescriptor::U32 | TypeDescriptor::I32 => (size_of::<u32>(), align_of::<u32>()),
            TypeDescriptor::Int | TypeDescriptor::UInt => {
                (size_of::<c_int>(), align_of::<c_int>())
            }
            TypeDescriptor::U64 | TypeDescriptor::I64 => (size_of::<u64>(), align_of::<u64>()),
            TypeDescriptor::Long | TypeDescriptor::ULong => {
                (size_of::<c_long>(), align_of::<c_long>())
            }
            TypeDescriptor::Float => (size_of::<f32>(), align_of::<f32>()),
            TypeDescriptor::Double => (size_of::<f64>(), align_of::<f64>()),
            TypeDescriptor::LongDouble => crate::cif::long_double_layout(),
            TypeDescriptor::Struct(fields) => {
                let (size, align, _) = struct_layout(fields);
                (size, align)
            }
        }
    }
}

/// (size, alignment, field offsets) of a C struct
///
/// A struct with no fields has size 0 and alignment 1.
fn struct_layout(fields: &[TypeDescriptor]) -> (usize, usize, Vec<usize>) {
    let mut offset = 0usize;
    let mut align = 1usize;
    let mut offsets = Vec::with_capacity(fields.len());

    for field in fields {
        let (field_size, field_align) = field.layout();
        offset = align_up(offset, field_align);
        offsets.push(offset);
        offset += field_size;
        align = align.max(field_align);
    }

    (align_up(offset, align), align, offsets)
}

/// Round `value` up to a multiple of the power-of-two `align`
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Struct(fields) => {
                write!(f, "struct(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
            scalar => write!(f, "{}", scalar.tag()),
        }
    }
}

impl FromStr for TypeDescriptor {
    type Err = FfiError;

    /// Parse the surface grammar, e.g. `struct(i32, struct(double, u8))`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = TypeParser {
            src: s,
            pos: 0,
            depth: 0,
        };
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if parser.pos != s.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(ty)
    }
}

/// Deepest `struct(...)` nesting the text form accepts
pub const MAX_STRUCT_DEPTH: usize = 64;

struct TypeParser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> TypeParser<'a> {
    fn parse_type(&mut self) -> FfiResult<TypeDescriptor> {
        self.skip_ws();
        let start = self.pos;
        let ident = self.ident();
        if ident.is_empty() {
            return Err(self.error("expected a type tag"));
        }

        if ident != "struct" {
            return TypeDescriptor::from_tag(ident).ok_or_else(|| FfiError::InvalidTypeSyntax {
                offset: start,
                reason: format!("unknown type tag '{}'", ident),
            });
        }

        if self.depth == MAX_STRUCT_DEPTH {
            return Err(FfiError::InvalidTypeSyntax {
                offset: start,
                reason: "nesting too deep".to_string(),
            });
        }
        self.expect('(')?;
        self.depth += 1;
        let fields = self.fields();
        self.depth -= 1;
        fields.map(TypeDescriptor::Struct)
    }

    fn fields(&mut self) -> FfiResult<Vec<TypeDescriptor>> {
        let mut fields = Vec::new();
        self.skip_ws();
        if self.eat(')') {
            return Ok(fields);
        }
        loop {
            fields.push(self.parse_type()?);
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            self.expect(')')?;
            return Ok(fields);
        }
    }

    fn ident(&mut self) -> &'a str {
        let rest: &'a str = &self.src[self.pos..];
        let len = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn skip_ws(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, c: char) -> bool {
        if self.src[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> FfiResult<()> {
        self.skip_ws();
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c)))
        }
    }

    fn error(&self, reason: &str) -> FfiError {
        FfiError::InvalidTypeSyntax {
            offset: self.pos,
            reason: reason.to_string(),
        }
    }
}
