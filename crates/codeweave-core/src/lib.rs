//! codeweave-core: primitives partagées du toolkit de réécriture de bytecode
//!
//! Fournit :
//! - `Encoding` : les deux schémas d'encodage d'instructions (legacy / wordcode)
//! - `CodeFlags` + `FlagSet` : le masque de flags d'une unité compilée (pack/unpack)
//! - `lnotab` : codec de la table des lignes (paires delta octet / delta ligne)
//! - `Const`, `RawCode` : l'unité compilée brute telle que l'hôte la charge
//! - `CodeFile` : conteneur binaire sectionné (magic, tags, CRC32)
//! - IO mémoire (little-endian) : `ByteWriter`, `ByteReader`
//! - Erreurs `CoreError` + alias `CoreResult<T>`
//!
//! Features :
//! - `serde` (par défaut) : derive (dé)sérialisation sur les structures utiles

#![deny(missing_docs)]

/* ─────────────────────────── Imports ─────────────────────────── */

use std::borrow::Cow;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/* ─────────────────────────── Modules publics ─────────────────────────── */

/// Schémas d'encodage (largeur d'opérande, plafonds de la table des lignes).
pub mod encoding;
/// Masque de flags d'une unité compilée.
pub mod flags;
/// Codec de la table des lignes.
pub mod lnotab;
/// Unité compilée brute, constantes et conteneur binaire.
pub mod raw;

pub use encoding::Encoding;
pub use flags::{CodeFlags, FlagSet, FlagsError};
pub use lnotab::{LineStart, LineTableError, LineTableFormat};
pub use raw::{CodeFile, Const, RawCode};

/* ─────────────────────────── Résultat commun ─────────────────────────── */

/// Alias résultat commun au core.
pub type CoreResult<T> = core::result::Result<T, CoreError>;

/* ─────────────────────────── Conteneur : constantes & Tags ─────────────────────────── */

/// Magic du conteneur : `b"CWCO"`.
pub const MAGIC_CWCO: &[u8; 4] = b"CWCO";

/// Version actuelle du conteneur.
pub const CWCO_VERSION: u16 = 1;

/// Tags de section (fourcc), exactement 4 octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SectionTag {
    /// META : compteurs, flags, première ligne, nom, fichier
    META = u32::from_be_bytes(*b"META"),
    /// CODE : octets d'instructions
    CODE = u32::from_be_bytes(*b"CODE"),
    /// CNST : table des constantes (taggées, récursives)
    CNST = u32::from_be_bytes(*b"CNST"),
    /// NAME : table des noms
    NAME = u32::from_be_bytes(*b"NAME"),
    /// VARS : noms des variables locales
    VARS = u32::from_be_bytes(*b"VARS"),
    /// FREE : variables libres
    FREE = u32::from_be_bytes(*b"FREE"),
    /// CELL : variables de cellule
    CELL = u32::from_be_bytes(*b"CELL"),
    /// LNTB : table des lignes encodée
    LNTB = u32::from_be_bytes(*b"LNTB"),
    /// CRCC : CRC32 trailer (u32 LE)
    CRCC = u32::from_be_bytes(*b"CRCC"),
}

impl SectionTag {
    /// Renvoie le fourcc sous forme de 4 octets big-endian.
    pub const fn to_be_bytes(self) -> [u8; 4] { (self as u32).to_be_bytes() }
    /// Lit un tag depuis 4 octets big-endian.
    pub const fn from_be_bytes(b: [u8; 4]) -> Option<Self> {
        match u32::from_be_bytes(b) {
            x if x == Self::META as u32 => Some(Self::META),
            x if x == Self::CODE as u32 => Some(Self::CODE),
            x if x == Self::CNST as u32 => Some(Self::CNST),
            x if x == Self::NAME as u32 => Some(Self::NAME),
            x if x == Self::VARS as u32 => Some(Self::VARS),
            x if x == Self::FREE as u32 => Some(Self::FREE),
            x if x == Self::CELL as u32 => Some(Self::CELL),
            x if x == Self::LNTB as u32 => Some(Self::LNTB),
            x if x == Self::CRCC as u32 => Some(Self::CRCC),
            _ => None,
        }
    }
}

/* ─────────────────────────── Byte Writer (LE) ─────────────────────────── */

/// Buffer d'écriture (croît automatiquement).
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Crée un writer vide.
    pub const fn new() -> Self { Self { buf: Vec::new() } }
    /// Accès en lecture au contenu.
    pub fn as_slice(&self) -> &[u8] { &self.buf }
    /// Taille courante.
    pub fn len(&self) -> usize { self.buf.len() }
    /// Vrai si rien n'a été écrit.
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }
    /// Récupère le buffer (consomme).
    pub fn into_vec(self) -> Vec<u8> { self.buf }
    /// Ajoute un octet.
    pub fn write_u8(&mut self, v: u8) { self.buf.push(v); }
    /// Ajoute des octets bruts.
    pub fn write_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }
    /// Écrit un tag (fourcc big-endian).
    pub fn write_tag(&mut self, tag: SectionTag) { self.write_bytes(&tag.to_be_bytes()); }
    /// Écrit un u16 little-endian.
    pub fn write_u16_le(&mut self, v: u16) {
        let mut b = [0; 2];
        LittleEndian::write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }
    /// Écrit un u32 little-endian.
    pub fn write_u32_le(&mut self, v: u32) {
        let mut b = [0; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }
    /// Écrit un i64 little-endian.
    pub fn write_i64_le(&mut self, v: i64) {
        let mut b = [0; 8];
        LittleEndian::write_i64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }
    /// Écrit un f64 little-endian.
    pub fn write_f64_le(&mut self, v: f64) {
        let mut b = [0; 8];
        LittleEndian::write_f64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }
    /// Écrit un blob préfixé par sa longueur (u32).
    pub fn write_blob(&mut self, bytes: &[u8]) -> CoreResult<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| CoreError::InvalidLength { section: None, len: bytes.len() as u64 })?;
        self.write_u32_le(len);
        self.write_bytes(bytes);
        Ok(())
    }
    /// Écrit une chaîne UTF-8 préfixée par sa longueur.
    pub fn write_str(&mut self, s: &str) -> CoreResult<()> { self.write_blob(s.as_bytes()) }
}

/* ─────────────────────────── Byte Reader (LE) ─────────────────────────── */

/// Lecteur séquentiel sur un slice d'octets (helpers LE).
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    /// Construit un lecteur.
    pub const fn new(data: &'a [u8]) -> Self { Self { data, off: 0 } }
    /// Offset courant.
    pub const fn offset(&self) -> usize { self.off }
    /// Taille restante.
    pub const fn remaining(&self) -> usize { self.data.len().saturating_sub(self.off) }

    /// Lit `n` octets (ou erreur si EOF).
    pub fn read_bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::UnexpectedEof { needed: n as u64, at: self.off as u64 });
        }
        let start = self.off;
        self.off += n;
        Ok(&self.data[start..self.off])
    }

    /// Lit un octet.
    pub fn read_u8(&mut self) -> CoreResult<u8> { Ok(self.read_bytes(1)?[0]) }

    /// Lit un tag (fourcc big-endian).
    pub fn read_tag(&mut self) -> CoreResult<SectionTag> {
        let b = self.read_bytes(4)?;
        let arr = [b[0], b[1], b[2], b[3]];
        SectionTag::from_be_bytes(arr).ok_or(CoreError::InvalidSectionTag { raw: u32::from_be_bytes(arr) })
    }

    /// Lit un u16 LE.
    pub fn read_u16_le(&mut self) -> CoreResult<u16> { Ok(LittleEndian::read_u16(self.read_bytes(2)?)) }

    /// Lit un u32 LE.
    pub fn read_u32_le(&mut self) -> CoreResult<u32> { Ok(LittleEndian::read_u32(self.read_bytes(4)?)) }

    /// Lit un i64 LE.
    pub fn read_i64_le(&mut self) -> CoreResult<i64> { Ok(LittleEndian::read_i64(self.read_bytes(8)?)) }

    /// Lit un f64 LE.
    pub fn read_f64_le(&mut self) -> CoreResult<f64> { Ok(LittleEndian::read_f64(self.read_bytes(8)?)) }

    /// Lit un blob préfixé par sa longueur (u32).
    pub fn read_blob(&mut self) -> CoreResult<&'a [u8]> {
        let len = self.read_u32_le()? as usize;
        self.read_bytes(len)
    }

    /// Lit une chaîne UTF-8 préfixée par sa longueur.
    pub fn read_string(&mut self) -> CoreResult<String> {
        let bytes = self.read_blob()?;
        core::str::from_utf8(bytes).map(str::to_owned).map_err(|_| CoreError::InvalidUtf8)
    }
}

/* ─────────────────────────── Erreurs ─────────────────────────── */

/// Erreurs de bas niveau communes (conteneur, IO).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Magic invalide (attendu `b"CWCO"`).
    #[error("invalid container magic")]
    InvalidMagic,
    /// Version de conteneur non supportée.
    #[error("unsupported container version {0}")]
    UnsupportedVersion(u16),
    /// Tag de section inconnu.
    #[error("invalid section tag: 0x{raw:08X}")]
    InvalidSectionTag {
        /// Valeur brute du tag.
        raw: u32,
    },
    /// Fin de buffer inattendue.
    #[error("unexpected EOF: need {needed} bytes at {at}")]
    UnexpectedEof {
        /// Nombre d'octets manquants.
        needed: u64,
        /// Offset où l'erreur s'est produite.
        at: u64,
    },
    /// Longueur de section invalide (ex: dépasse le buffer).
    #[error("invalid length{}: {len}", section.as_ref().map(|s| format!(" for {s}")).unwrap_or_default())]
    InvalidLength {
        /// Nom de section (si connu).
        section: Option<Cow<'static, str>>,
        /// Longueur fautive.
        len: u64,
    },
    /// UTF-8 invalide.
    #[error("invalid utf-8")]
    InvalidUtf8,
    /// Données corrompues (CRC / format).
    #[error("corrupted: {0}")]
    Corrupted(Cow<'static, str>),
}

impl CoreError {
    /// Construit une erreur « corrompu ».
    pub fn corrupted(msg: impl Into<Cow<'static, str>>) -> Self { Self::Corrupted(msg.into()) }
}

/* ─────────────────────────── Prélude (reexports utiles) ─────────────────────────── */

/// Prélude pratique pour importer les types/funcs clés du crate.
pub mod prelude {
    /// Réexports utiles pour une importation rapide.
    pub use super::{
        ByteReader, ByteWriter, CodeFile, CodeFlags, Const, CoreError, CoreResult, Encoding,
        FlagSet, LineStart, LineTableFormat, RawCode, SectionTag, CWCO_VERSION, MAGIC_CWCO,
    };
}

/* ─────────────────────────── Tests ─────────────────────────── */
