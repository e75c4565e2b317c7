//! Line-oriented text assembler.
//!
//! ```text
//! .name       clamp
//! .args       x, *rest
//! .line 3
//!     LOAD_FAST          x
//!     POP_JUMP_IF_FALSE  done
//!     LOAD_CONST         "positive"
//!     RETURN_VALUE
//! done:
//!     LOAD_CONST         None
//!     RETURN_VALUE
//! ```
//!
//! Directives: `.name`, `.filename`, `.firstlineno`, `.args`, `.cellvars`,
//! `.freevars`, `.line`, `.encoding`. Lines starting with `;` or `#` are
//! comments, as is anything after an unquoted `;`.

use std::collections::HashMap;

use codeweave_core::{Const, Encoding};
use codeweave_ops::{Opcode, OperandClass};
use thiserror::Error;

use crate::{
    code::{Code, CodeBuilder, Label},
    error::ConstructionError,
    instr::Operand,
};

/// Assembly failure, tagged with its 1-based source line.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {kind}")]
pub struct AsmError {
    /// Source line.
    pub line: usize,
    /// What went wrong.
    pub kind: AsmErrorKind,
}

/// Kinds of [`AsmError`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AsmErrorKind {
    /// Mnemonic outside the catalog.
    #[error("unknown instruction `{0}`")]
    UnknownOpcode(String),
    /// Directive not understood.
    #[error("unknown directive `.{0}`")]
    UnknownDirective(String),
    /// Directive with an unusable value.
    #[error("bad value for `.{directive}`: `{value}`")]
    BadDirective {
        /// Directive name.
        directive: String,
        /// Offending value.
        value: String,
    },
    /// Operand required but absent.
    #[error("{0} needs an operand")]
    MissingOperand(Opcode),
    /// Operand given to an instruction that takes none.
    #[error("{0} takes no operand")]
    UnexpectedOperand(Opcode),
    /// Integer operand that does not parse.
    #[error("expected an integer, got `{0}`")]
    BadInt(String),
    /// Constant literal that does not parse.
    #[error("bad literal: {0}")]
    BadLiteral(String),
    /// Name operand that is not a single identifier.
    #[error("expected an identifier, got `{0}`")]
    BadIdentifier(String),
    /// Label defined twice.
    #[error("label `{0}` defined twice")]
    DuplicateLabel(String),
    /// Label used but never defined.
    #[error("label `{0}` is never defined")]
    UndefinedLabel(String),
    /// The instructions do not form a valid unit.
    #[error(transparent)]
    Construction(#[from] ConstructionError),
}

/// Assembles `source` into a [`Code`].
pub fn assemble(source: &str) -> Result<Code, AsmError> {
    let mut asm = Assembler::new();
    let mut last = 0;
    for (idx, raw_line) in source.lines().enumerate() {
        last = idx + 1;
        asm.current = last;
        asm.line(raw_line).map_err(|kind| AsmError { line: last, kind })?;
    }
    asm.finish(last)
}

struct LabelState {
    label: Label,
    defined: bool,
    first_use: usize,
}

struct Assembler {
    builder: CodeBuilder,
    labels: HashMap<String, LabelState>,
    current: usize,
}

impl Assembler {
    fn new() -> Self { Self { builder: CodeBuilder::new(), labels: HashMap::new(), current: 0 } }

    fn line(&mut self, raw: &str) -> Result<(), AsmErrorKind> {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            return Ok(());
        }
        if let Some(directive) = line.strip_prefix('.') {
            return self.directive(directive);
        }
        if let Some(name) = line.strip_suffix(':') {
            return self.define_label(name.trim());
        }
        let (mnemonic, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let opcode = Opcode::from_name(&mnemonic.to_ascii_uppercase())
            .map_err(|_| AsmErrorKind::UnknownOpcode(mnemonic.to_owned()))?;
        let operand = self.operand(opcode, rest.trim())?;
        self.builder.push(opcode, operand)?;
        Ok(())
    }

    fn directive(&mut self, text: &str) -> Result<(), AsmErrorKind> {
        let (name, value) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
        let value = value.trim();
        let bad = || AsmErrorKind::BadDirective { directive: name.to_owned(), value: value.to_owned() };
        match name {
            "name" => {
                self.builder.name(value);
            }
            "filename" => {
                self.builder.filename(value);
            }
            "firstlineno" => {
                self.builder.firstlineno(value.parse().map_err(|_| bad())?);
            }
            "line" => {
                self.builder.line(value.parse().map_err(|_| bad())?);
            }
            "encoding" => {
                self.builder.encoding(Encoding::from_name(value).ok_or_else(bad)?);
            }
            "args" => {
                self.builder.args(split_list(value))?;
            }
            "cellvars" => {
                self.builder.cellvars(split_list(value));
            }
            "freevars" => {
                self.builder.freevars(split_list(value));
            }
            other => return Err(AsmErrorKind::UnknownDirective(other.to_owned())),
        }
        Ok(())
    }

    fn define_label(&mut self, name: &str) -> Result<(), AsmErrorKind> {
        if !is_identifier(name) {
            return Err(AsmErrorKind::BadIdentifier(name.to_owned()));
        }
        let label = self.label(name)?;
        let state = self.labels.get_mut(name).ok_or_else(|| AsmErrorKind::UndefinedLabel(name.to_owned()))?;
        if state.defined {
            return Err(AsmErrorKind::DuplicateLabel(name.to_owned()));
        }
        state.defined = true;
        self.builder.place(label);
        Ok(())
    }

    fn label(&mut self, name: &str) -> Result<Label, AsmErrorKind> {
        if let Some(state) = self.labels.get(name) {
            return Ok(state.label);
        }
        let label = self.builder.label()?;
        self.labels.insert(name.to_owned(), LabelState { label, defined: false, first_use: self.current });
        Ok(label)
    }

    fn operand(&mut self, opcode: Opcode, text: &str) -> Result<Operand, AsmErrorKind> {
        let class = opcode.operand_class();
        if !class.has_arg() {
            return if text.is_empty() { Ok(Operand::None) } else { Err(AsmErrorKind::UnexpectedOperand(opcode)) };
        }
        if text.is_empty() {
            return Err(AsmErrorKind::MissingOperand(opcode));
        }
        let ident = |text: &str| {
            if is_identifier(text) {
                Ok(text.to_owned())
            } else {
                Err(AsmErrorKind::BadIdentifier(text.to_owned()))
            }
        };
        Ok(match class {
            OperandClass::None => Operand::None,
            OperandClass::Int => Operand::Int(text.parse().map_err(|_| AsmErrorKind::BadInt(text.to_owned()))?),
            OperandClass::Const => Operand::Const(parse_literal(text)?),
            OperandClass::Name => Operand::Name(ident(text)?),
            OperandClass::Local => Operand::Local(ident(text)?),
            OperandClass::Free => Operand::Free(ident(text)?),
            OperandClass::JumpAbs | OperandClass::JumpRel => {
                let name = ident(text)?;
                Operand::Jump(self.label(&name)?.id())
            }
        })
    }

    fn finish(mut self, last: usize) -> Result<Code, AsmError> {
        let undefined = self
            .labels
            .iter()
            .filter(|(_, s)| !s.defined)
            .min_by_key(|(name, s)| (s.first_use, (*name).clone()));
        if let Some((name, state)) = undefined {
            return Err(AsmError { line: state.first_use, kind: AsmErrorKind::UndefinedLabel(name.clone()) });
        }
        self.builder.build().map_err(|e| AsmError { line: last, kind: e.into() })
    }
}

fn strip_comment(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with(';') || trimmed.starts_with('#') {
        return "";
    }
    let mut quote = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (Some(_), _) if escaped => escaped = false,
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '"' | '\'') => quote = Some(c),
            (None, ';') => return &line[..i],
            _ => {}
        }
    }
    line
}

fn split_list(value: &str) -> Vec<&str> {
    value.split(|c: char| c == ',' || c.is_whitespace()).filter(|s| !s.is_empty()).collect()
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_alphabetic() || c == '_' || c == '<')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '<' | '>' | '.'))
}

/* ─────────────────────────── Literals ─────────────────────────── */

/// Parses a constant literal: `None`, `True`, `False`, `...`, integers,
/// floats, quoted strings, `b"bytes"` and parenthesised tuples.
pub fn parse_literal(text: &str) -> Result<Const, AsmErrorKind> {
    let mut p = LiteralParser { src: text, pos: 0 };
    let value = p.value()?;
    p.skip_ws();
    if p.pos != text.len() {
        return Err(AsmErrorKind::BadLiteral(format!("trailing input in `{text}`")));
    }
    Ok(value)
}

struct LiteralParser<'a> {
    src: &'a str,
    pos: usize,
}

impl LiteralParser<'_> {
    fn rest(&self) -> &str { &self.src[self.pos..] }

    fn peek(&self) -> Option<char> { self.rest().chars().next() }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn value(&mut self) -> Result<Const, AsmErrorKind> {
        self.skip_ws();
        match self.peek() {
            Some('(') => self.tuple(),
            Some(q @ ('"' | '\'')) => {
                self.bump();
                Ok(Const::Str(self.quoted(q)?))
            }
            Some('b') if matches!(self.rest().chars().nth(1), Some('"' | '\'')) => {
                self.bump();
                let q = self.bump().unwrap_or('"');
                let s = self.quoted(q)?;
                s.chars()
                    .map(|c| u8::try_from(u32::from(c)).map_err(|_| AsmErrorKind::BadLiteral(format!("non-byte `{c}`"))))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Const::Bytes)
            }
            Some(_) => self.atom(),
            None => Err(AsmErrorKind::BadLiteral("empty literal".to_owned())),
        }
    }

    fn tuple(&mut self) -> Result<Const, AsmErrorKind> {
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(')') {
                self.bump();
                return Ok(Const::Tuple(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => {}
                Some(')') => return Ok(Const::Tuple(items)),
                _ => return Err(AsmErrorKind::BadLiteral("unterminated tuple".to_owned())),
            }
        }
    }

    fn quoted(&mut self, quote: char) -> Result<String, AsmErrorKind> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(AsmErrorKind::BadLiteral("unterminated string".to_owned())),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let c = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('x') => {
                            let hex: String = (0..2).filter_map(|_| self.bump()).collect();
                            u8::from_str_radix(&hex, 16)
                                .map(char::from)
                                .map_err(|_| AsmErrorKind::BadLiteral(format!("bad escape \\x{hex}")))?
                        }
                        Some(other) => other,
                        None => return Err(AsmErrorKind::BadLiteral("incomplete escape".to_owned())),
                    };
                    out.push(c);
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn atom(&mut self) -> Result<Const, AsmErrorKind> {
        let start = self.pos;
        while self.peek().is_some_and(|c| !c.is_whitespace() && c != ',' && c != ')') {
            self.bump();
        }
        let token = &self.src[start..self.pos];
        match token {
            "None" => Ok(Const::None),
            "True" => Ok(Const::Bool(true)),
            "False" => Ok(Const::Bool(false)),
            "..." => Ok(Const::Ellipsis),
            _ => token
                .parse::<i64>()
                .map(Const::Int)
                .or_else(|_| token.parse::<f64>().map(Const::Float))
                .map_err(|_| AsmErrorKind::BadLiteral(format!("`{token}`"))),
        }
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */
