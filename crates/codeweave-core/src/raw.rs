//! Raw compiled units, their constants, and the sectioned on-disk container.
//!
//! Container layout (all integers little-endian, tags are big-endian fourcc):
//!
//! ```text
//! "CWCO" | version u16 | encoding u8
//! META len payload | CODE len payload | CNST len payload | NAME len payload
//! VARS len payload | FREE len payload | CELL len payload | LNTB len payload
//! CRCC 4 crc32(everything before CRCC)
//! ```
//!
//! Nested code constants reuse the section sequence (without magic or CRC).

use core::{
    fmt,
    hash::{Hash, Hasher},
    mem,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    ByteReader, ByteWriter, CoreError, CoreResult, Encoding, SectionTag, CWCO_VERSION, MAGIC_CWCO,
};

const CONST_TAG_NONE: u8 = 0x00;
const CONST_TAG_ELLIPSIS: u8 = 0x01;
const CONST_TAG_BOOL: u8 = 0x02;
const CONST_TAG_INT: u8 = 0x03;
const CONST_TAG_FLOAT: u8 = 0x04;
const CONST_TAG_STR: u8 = 0x05;
const CONST_TAG_BYTES: u8 = 0x06;
const CONST_TAG_TUPLE: u8 = 0x07;
const CONST_TAG_CODE: u8 = 0x08;

/// Values that can live in a constant table.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Const {
    /// The null singleton.
    None,
    /// The `...` singleton.
    Ellipsis,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// Text literal.
    Str(String),
    /// Byte-string literal.
    Bytes(Vec<u8>),
    /// Tuple of constants.
    Tuple(Vec<Const>),
    /// Nested compiled unit.
    Code(Box<RawCode>),
}

impl Const {
    /// Type label used by listings and errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ellipsis => "ellipsis",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::Code(_) => "code",
        }
    }

    /// Integer payload, if any.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Nested unit, if any.
    pub fn as_code(&self) -> Option<&RawCode> {
        match self {
            Self::Code(code) => Some(code),
            _ => None,
        }
    }
}

// Type-aware: `Int(1)` and `Bool(true)` differ, floats compare by bit pattern.
impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Const {}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Self::None | Self::Ellipsis => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Str(s) => s.hash(state),
            Self::Bytes(bytes) => bytes.hash(state),
            Self::Tuple(items) => items.hash(state),
            Self::Code(code) => code.hash(state),
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Ellipsis => f.write_str("..."),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bytes(bytes) => {
                f.write_str("b\"")?;
                for b in bytes {
                    write!(f, "{}", core::ascii::escape_default(*b))?;
                }
                f.write_str("\"")
            }
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::Code(code) => write!(f, "<code {}>", code.name),
        }
    }
}

/// Compiled unit in the host's raw form: operand-indexed bytes plus side tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawCode {
    /// Positional parameter count.
    pub argcount: u32,
    /// Keyword-only parameter count.
    pub kwonlyargcount: u32,
    /// Size of `varnames`.
    pub nlocals: u32,
    /// Maximum operand stack depth.
    pub stacksize: u32,
    /// Raw flags mask (see [`crate::CodeFlags`]).
    pub flags: u32,
    /// Instruction bytes.
    pub code: Vec<u8>,
    /// Constant table.
    pub consts: Vec<Const>,
    /// Global/attribute name table.
    pub names: Vec<String>,
    /// Local variable names, parameters first.
    pub varnames: Vec<String>,
    /// Source file.
    pub filename: String,
    /// Routine name.
    pub name: String,
    /// First source line.
    pub firstlineno: u32,
    /// Encoded line table.
    pub lnotab: Vec<u8>,
    /// Free variable names.
    pub freevars: Vec<String>,
    /// Cell variable names.
    pub cellvars: Vec<String>,
}

impl RawCode {
    /// Nested units found in the constant table (one level).
    pub fn nested(&self) -> impl Iterator<Item = &RawCode> + '_ {
        self.consts.iter().filter_map(Const::as_code)
    }
}

/// A raw unit together with the encoding its bytes use.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CodeFile {
    /// Instruction encoding of `code` and of every nested unit.
    pub encoding: Encoding,
    /// Top-level unit.
    pub code: RawCode,
}

impl CodeFile {
    /// Bundles a unit with its encoding.
    pub const fn new(encoding: Encoding, code: RawCode) -> Self { Self { encoding, code } }

    /// Serializes to the container format.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut w = ByteWriter::new();
        w.write_bytes(MAGIC_CWCO);
        w.write_u16_le(CWCO_VERSION);
        w.write_u8(self.encoding.tag());
        write_unit(&mut w, &self.code)?;

        let crc = crc32fast::hash(w.as_slice());
        w.write_tag(SectionTag::CRCC);
        w.write_u32_le(4);
        w.write_u32_le(crc);
        Ok(w.into_vec())
    }

    /// Parses the container format, checking magic, version and CRC.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < 4 + 2 + 1 + 12 {
            return Err(CoreError::UnexpectedEof { needed: 19, at: bytes.len() as u64 });
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 12);
        let mut t = ByteReader::new(trailer);
        if t.read_tag()? != SectionTag::CRCC || t.read_u32_le()? != 4 {
            return Err(CoreError::corrupted("missing CRC trailer"));
        }
        let expected = t.read_u32_le()?;
        if crc32fast::hash(body) != expected {
            return Err(CoreError::corrupted("CRC mismatch"));
        }

        let mut r = ByteReader::new(body);
        if r.read_bytes(4)? != MAGIC_CWCO {
            return Err(CoreError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if version != CWCO_VERSION {
            return Err(CoreError::UnsupportedVersion(version));
        }
        let tag = r.read_u8()?;
        let encoding = Encoding::from_tag(tag)
            .ok_or_else(|| CoreError::corrupted(format!("unknown encoding tag {tag}")))?;
        let code = read_unit(&mut r)?;
        if r.remaining() != 0 {
            return Err(CoreError::corrupted("trailing bytes after last section"));
        }
        Ok(Self { encoding, code })
    }
}

/* ─────────────────────────── Sections ─────────────────────────── */

fn write_section(
    w: &mut ByteWriter,
    tag: SectionTag,
    body: impl FnOnce(&mut ByteWriter) -> CoreResult<()>,
) -> CoreResult<()> {
    let mut inner = ByteWriter::new();
    body(&mut inner)?;
    w.write_tag(tag);
    w.write_blob(inner.as_slice())
}

fn write_strings(w: &mut ByteWriter, items: &[String]) -> CoreResult<()> {
    w.write_u32_le(count(items.len())?);
    items.iter().try_for_each(|s| w.write_str(s))
}

fn count(n: usize) -> CoreResult<u32> {
    u32::try_from(n).map_err(|_| CoreError::InvalidLength { section: None, len: n as u64 })
}

fn write_unit(w: &mut ByteWriter, code: &RawCode) -> CoreResult<()> {
    write_section(w, SectionTag::META, |s| {
        for v in [code.argcount, code.kwonlyargcount, code.nlocals, code.stacksize, code.flags, code.firstlineno] {
            s.write_u32_le(v);
        }
        s.write_str(&code.name)?;
        s.write_str(&code.filename)
    })?;
    write_section(w, SectionTag::CODE, |s| {
        s.write_bytes(&code.code);
        Ok(())
    })?;
    write_section(w, SectionTag::CNST, |s| {
        s.write_u32_le(count(code.consts.len())?);
        code.consts.iter().try_for_each(|c| write_const(s, c))
    })?;
    write_section(w, SectionTag::NAME, |s| write_strings(s, &code.names))?;
    write_section(w, SectionTag::VARS, |s| write_strings(s, &code.varnames))?;
    write_section(w, SectionTag::FREE, |s| write_strings(s, &code.freevars))?;
    write_section(w, SectionTag::CELL, |s| write_strings(s, &code.cellvars))?;
    write_section(w, SectionTag::LNTB, |s| {
        s.write_bytes(&code.lnotab);
        Ok(())
    })
}

fn write_const(w: &mut ByteWriter, value: &Const) -> CoreResult<()> {
    match value {
        Const::None => w.write_u8(CONST_TAG_NONE),
        Const::Ellipsis => w.write_u8(CONST_TAG_ELLIPSIS),
        Const::Bool(b) => {
            w.write_u8(CONST_TAG_BOOL);
            w.write_u8(u8::from(*b));
        }
        Const::Int(v) => {
            w.write_u8(CONST_TAG_INT);
            w.write_i64_le(*v);
        }
        Const::Float(v) => {
            w.write_u8(CONST_TAG_FLOAT);
            w.write_f64_le(*v);
        }
        Const::Str(s) => {
            w.write_u8(CONST_TAG_STR);
            w.write_str(s)?;
        }
        Const::Bytes(bytes) => {
            w.write_u8(CONST_TAG_BYTES);
            w.write_blob(bytes)?;
        }
        Const::Tuple(items) => {
            w.write_u8(CONST_TAG_TUPLE);
            w.write_u32_le(count(items.len())?);
            for item in items {
                write_const(w, item)?;
            }
        }
        Const::Code(code) => {
            w.write_u8(CONST_TAG_CODE);
            let mut inner = ByteWriter::new();
            write_unit(&mut inner, code)?;
            w.write_blob(inner.as_slice())?;
        }
    }
    Ok(())
}

fn expect_section<'a>(r: &mut ByteReader<'a>, tag: SectionTag) -> CoreResult<ByteReader<'a>> {
    let found = r.read_tag()?;
    if found != tag {
        return Err(CoreError::corrupted(format!("expected section {tag:?}, found {found:?}")));
    }
    Ok(ByteReader::new(r.read_blob()?))
}

fn read_strings(r: &mut ByteReader<'_>) -> CoreResult<Vec<String>> {
    let n = r.read_u32_le()?;
    (0..n).map(|_| r.read_string()).collect()
}

fn read_table(r: &mut ByteReader<'_>, tag: SectionTag) -> CoreResult<Vec<String>> {
    let mut sec = expect_section(r, tag)?;
    let table = read_strings(&mut sec)?;
    finish(&sec, tag)?;
    Ok(table)
}

fn finish(r: &ByteReader<'_>, tag: SectionTag) -> CoreResult<()> {
    if r.remaining() == 0 {
        Ok(())
    } else {
        Err(CoreError::InvalidLength {
            section: Some(format!("{tag:?}").into()),
            len: r.remaining() as u64,
        })
    }
}

fn read_unit(r: &mut ByteReader<'_>) -> CoreResult<RawCode> {
    let mut meta = expect_section(r, SectionTag::META)?;
    let mut header = [0u32; 6];
    for slot in &mut header {
        *slot = meta.read_u32_le()?;
    }
    let [argcount, kwonlyargcount, nlocals, stacksize, flags, firstlineno] = header;
    let name = meta.read_string()?;
    let filename = meta.read_string()?;
    finish(&meta, SectionTag::META)?;

    let mut code_sec = expect_section(r, SectionTag::CODE)?;
    let code = code_sec.read_bytes(code_sec.remaining())?.to_vec();

    let mut cnst = expect_section(r, SectionTag::CNST)?;
    let n = cnst.read_u32_le()?;
    let consts = (0..n).map(|_| read_const(&mut cnst)).collect::<CoreResult<Vec<_>>>()?;
    finish(&cnst, SectionTag::CNST)?;

    let names = read_table(r, SectionTag::NAME)?;
    let varnames = read_table(r, SectionTag::VARS)?;
    let freevars = read_table(r, SectionTag::FREE)?;
    let cellvars = read_table(r, SectionTag::CELL)?;

    let mut lntb = expect_section(r, SectionTag::LNTB)?;
    let lnotab = lntb.read_bytes(lntb.remaining())?.to_vec();

    Ok(RawCode {
        argcount,
        kwonlyargcount,
        nlocals,
        stacksize,
        flags,
        code,
        consts,
        names,
        varnames,
        filename,
        name,
        firstlineno,
        lnotab,
        freevars,
        cellvars,
    })
}

fn read_const(r: &mut ByteReader<'_>) -> CoreResult<Const> {
    let tag = r.read_u8()?;
    Ok(match tag {
        CONST_TAG_NONE => Const::None,
        CONST_TAG_ELLIPSIS => Const::Ellipsis,
        CONST_TAG_BOOL => Const::Bool(r.read_u8()? != 0),
        CONST_TAG_INT => Const::Int(r.read_i64_le()?),
        CONST_TAG_FLOAT => Const::Float(r.read_f64_le()?),
        CONST_TAG_STR => Const::Str(r.read_string()?),
        CONST_TAG_BYTES => Const::Bytes(r.read_blob()?.to_vec()),
        CONST_TAG_TUPLE => {
            let n = r.read_u32_le()?;
            Const::Tuple((0..n).map(|_| read_const(r)).collect::<CoreResult<_>>()?)
        }
        CONST_TAG_CODE => {
            let mut inner = ByteReader::new(r.read_blob()?);
            let code = read_unit(&mut inner)?;
            if inner.remaining() != 0 {
                return Err(CoreError::corrupted("trailing bytes in nested code"));
            }
            Const::Code(Box::new(code))
        }
        other => return Err(CoreError::corrupted(format!("unknown constant tag 0x{other:02X}"))),
    })
}

/* ─────────────────────────── Tests ─────────────────────────── */
