//! Telecommand catalog extraction.
//!
//! Firmware source files declare telecommands in structured comment blocks:
//!
//! ```text
//! // @tcmd SET_POWER 0x10
//! // @args level: u8 in 0..=100, mode: u16
//! // @ready for_flight
//! // @resp u8
//! // @doc Set the EPS output power level.
//! // @end
//! ```
//!
//! [`extract_catalog`] scans a source tree for these blocks and builds an
//! immutable [`Catalog`]. Individually malformed declarations are excluded
//! with a warning; duplicate identifiers across the tree are fatal.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Validated telecommand identifier, stable across a firmware build.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TcmdId(pub u16);

impl fmt::Display for TcmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Primitive parameter types understood by the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    F64,
    Str,
    Bytes,
}

impl ParamType {
    /// Resolve a declared type token against the fixed vocabulary.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "u8" | "uint8" => Some(ParamType::U8),
            "u16" | "uint16" => Some(ParamType::U16),
            "u32" | "uint32" => Some(ParamType::U32),
            "u64" | "uint64" => Some(ParamType::U64),
            "i32" | "int32" => Some(ParamType::I32),
            "i64" | "int64" => Some(ParamType::I64),
            "f64" | "float" | "double" => Some(ParamType::F64),
            "str" | "string" => Some(ParamType::Str),
            "bytes" | "hex" => Some(ParamType::Bytes),
            _ => None,
        }
    }

    /// Whether values of this type carry an integer magnitude that bounds
    /// can be checked against.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ParamType::U8
                | ParamType::U16
                | ParamType::U32
                | ParamType::U64
                | ParamType::I32
                | ParamType::I64
        )
    }

    /// Intrinsic value range for integer types.
    pub fn intrinsic_bounds(self) -> Option<Bounds> {
        let (min, max) = match self {
            ParamType::U8 => (0, i128::from(u8::MAX)),
            ParamType::U16 => (0, i128::from(u16::MAX)),
            ParamType::U32 => (0, i128::from(u32::MAX)),
            ParamType::U64 => (0, i128::from(u64::MAX)),
            ParamType::I32 => (i128::from(i32::MIN), i128::from(i32::MAX)),
            ParamType::I64 => (i128::from(i64::MIN), i128::from(i64::MAX)),
            _ => return None,
        };
        Some(Bounds { min, max })
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::U8 => "u8",
            ParamType::U16 => "u16",
            ParamType::U32 => "u32",
            ParamType::U64 => "u64",
            ParamType::I32 => "i32",
            ParamType::I64 => "i64",
            ParamType::F64 => "f64",
            ParamType::Str => "str",
            ParamType::Bytes => "bytes",
        };
        write!(f, "{name}")
    }
}

/// Inclusive value bounds for an integer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: i128,
    pub max: i128,
}

/// One declared parameter: name, type, and optional declared bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub bounds: Option<Bounds>,
}

/// How far along a telecommand is; carried as data only, never enforced
/// by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReadinessLevel {
    #[default]
    InDevelopment,
    ForTestingOnly,
    ForFlight,
}

impl ReadinessLevel {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "in_development" | "dev" => Some(ReadinessLevel::InDevelopment),
            "for_testing_only" | "testing" => Some(ReadinessLevel::ForTestingOnly),
            "for_flight" | "flight" => Some(ReadinessLevel::ForFlight),
            _ => None,
        }
    }
}

/// A single telecommand as declared in firmware source. Immutable once
/// extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelecommandDefinition {
    pub id: TcmdId,
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub doc: String,
    /// Expected response field types, when statically declared via `@resp`.
    pub response_hint: Option<Vec<ParamType>>,
    pub readiness: ReadinessLevel,
}

impl TelecommandDefinition {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Immutable registry of telecommands built from one firmware source tree.
///
/// Rebuilding produces a new `Catalog`; concurrent readers never observe a
/// partial one. Safe to share behind an `Arc` with no locking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    by_id: BTreeMap<TcmdId, TelecommandDefinition>,
    /// Declaration order, for export collaborators that want source order.
    order: Vec<TcmdId>,
}

impl Catalog {
    /// Build a catalog directly from definitions, for collaborators that
    /// already hold them (simulators, procedure files). Duplicate ids are
    /// rejected the same way extraction rejects them.
    pub fn from_definitions(
        defs: impl IntoIterator<Item = TelecommandDefinition>,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Catalog::default();
        for def in defs {
            catalog.insert(def)?;
        }
        Ok(catalog)
    }

    /// Look up a definition by identifier.
    pub fn get(&self, id: TcmdId) -> Option<&TelecommandDefinition> {
        self.by_id.get(&id)
    }

    /// Look up a definition by human name. With duplicate names the first
    /// declaration wins (the duplicate is flagged during extraction).
    pub fn get_by_name(&self, name: &str) -> Option<&TelecommandDefinition> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .find(|def| def.name == name)
    }

    /// Definitions in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &TelecommandDefinition> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn insert(&mut self, def: TelecommandDefinition) -> Result<(), CatalogError> {
        if let Some(existing) = self.by_id.get(&def.id) {
            return Err(CatalogError::DuplicateId {
                id: def.id,
                first: existing.name.clone(),
                second: def.name,
            });
        }
        self.order.push(def.id);
        self.by_id.insert(def.id, def);
        Ok(())
    }
}

/// Non-fatal problem recorded while scanning a source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionWarning {
    pub file: PathBuf,
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ExtractionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.message)
    }
}

/// Result of a successful extraction: the catalog plus diagnostics for
/// declarations that were skipped or flagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub catalog: Catalog,
    pub warnings: Vec<ExtractionWarning>,
}

/// Fatal extraction failures. Individually malformed declarations are not
/// fatal; they are excluded with an [`ExtractionWarning`].
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unreadable source tree {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no telecommand declarations found under {path}")]
    NoTelecommands { path: PathBuf },
    #[error("duplicate telecommand id {id}: `{first}` and `{second}`")]
    DuplicateId {
        id: TcmdId,
        first: String,
        second: String,
    },
}

/// Scan a firmware source tree and build a telecommand catalog.
///
/// The scan is a pure read: it never writes the tree. Files that are not
/// UTF-8 text are skipped with a warning, as are malformed declarations.
pub fn extract_catalog(root: &Path) -> Result<ExtractionReport, CatalogError> {
    let mut files = Vec::new();
    collect_files(root, &mut files).map_err(|source| CatalogError::Unreadable {
        path: root.to_path_buf(),
        source,
    })?;
    files.sort();

    let mut catalog = Catalog::default();
    let mut warnings = Vec::new();

    for file in &files {
        let content = match fs::read_to_string(file) {
            Ok(content) => content,
            Err(err) => {
                push_warning(
                    &mut warnings,
                    file,
                    0,
                    format!("skipped unreadable file: {err}"),
                );
                continue;
            }
        };
        scan_file(file, &content, &mut catalog, &mut warnings)?;
    }

    if catalog.is_empty() {
        return Err(CatalogError::NoTelecommands {
            path: root.to_path_buf(),
        });
    }

    debug!(
        telecommands = catalog.len(),
        warnings = warnings.len(),
        files = files.len(),
        "catalog extraction complete"
    );

    Ok(ExtractionReport { catalog, warnings })
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            // Unreadable subdirectories are fatal like the root: the tree
            // must be consistently readable to trust the result.
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn push_warning(warnings: &mut Vec<ExtractionWarning>, file: &Path, line: usize, message: String) {
    warn!(file = %file.display(), line, %message, "extraction warning");
    warnings.push(ExtractionWarning {
        file: file.to_path_buf(),
        line,
        message,
    });
}

fn scan_file(
    file: &Path,
    content: &str,
    catalog: &mut Catalog,
    warnings: &mut Vec<ExtractionWarning>,
) -> Result<(), CatalogError> {
    let mut lines = content.lines().enumerate();

    while let Some((idx, raw)) = lines.next() {
        let line = strip_comment_decoration(raw);
        let Some(header) = line.strip_prefix("@tcmd") else {
            continue;
        };
        let start_line = idx + 1;

        // Collect the block body up to @end.
        let mut body = Vec::new();
        let mut terminated = false;
        for (body_idx, body_raw) in lines.by_ref() {
            let body_line = strip_comment_decoration(body_raw);
            if body_line == "@end" {
                terminated = true;
                break;
            }
            body.push((body_idx + 1, body_line.to_string()));
        }
        if !terminated {
            push_warning(
                warnings,
                file,
                start_line,
                "unterminated @tcmd block (missing @end)".to_string(),
            );
            continue;
        }

        match parse_declaration(header, &body) {
            Ok(def) => {
                if let Some(existing) = catalog.get_by_name(&def.name) {
                    push_warning(
                        warnings,
                        file,
                        start_line,
                        format!(
                            "duplicate name `{}` (ids {} and {})",
                            def.name, existing.id, def.id
                        ),
                    );
                }
                catalog.insert(def)?;
            }
            Err(reason) => {
                push_warning(
                    warnings,
                    file,
                    start_line,
                    format!("declaration excluded: {reason}"),
                );
            }
        }
    }

    Ok(())
}

/// Strip leading comment markers and trailing block-comment closers so the
/// grammar works inside `//`, `/* */`, and `#` comments alike.
fn strip_comment_decoration(raw: &str) -> &str {
    let mut line = raw.trim();
    for prefix in ["//!", "///", "//", "/*", "*", "#"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            line = rest.trim_start();
            break;
        }
    }
    if let Some(rest) = line.strip_suffix("*/") {
        line = rest.trim_end();
    }
    line
}

fn parse_declaration(
    header: &str,
    body: &[(usize, String)],
) -> Result<TelecommandDefinition, String> {
    let mut tokens = header.split_whitespace();
    let name = tokens.next().ok_or("missing telecommand name")?;
    let id_token = tokens.next().ok_or("missing telecommand id")?;
    if tokens.next().is_some() {
        return Err("trailing tokens after id".to_string());
    }
    let id = parse_int(id_token).ok_or_else(|| format!("bad id `{id_token}`"))?;
    let id = u16::try_from(id).map_err(|_| format!("id `{id_token}` does not fit u16"))?;

    let mut params = Vec::new();
    let mut doc_lines: Vec<&str> = Vec::new();
    let mut readiness = ReadinessLevel::default();
    let mut response_hint = None;

    for (_, line) in body {
        if let Some(args) = line.strip_prefix("@args") {
            params = parse_params(args)?;
        } else if let Some(token) = line.strip_prefix("@ready") {
            readiness = ReadinessLevel::from_token(token.trim())
                .ok_or_else(|| format!("unknown readiness level `{}`", token.trim()))?;
        } else if let Some(types) = line.strip_prefix("@resp") {
            response_hint = Some(parse_response_hint(types)?);
        } else if let Some(text) = line.strip_prefix("@doc") {
            doc_lines.push(text.trim());
        } else if line.starts_with('@') {
            return Err(format!("unknown directive `{line}`"));
        } else if !line.is_empty() {
            // Bare continuation lines extend the docstring.
            doc_lines.push(line);
        }
    }

    Ok(TelecommandDefinition {
        id: TcmdId(id),
        name: name.to_string(),
        params,
        doc: doc_lines.join("\n"),
        response_hint,
        readiness,
    })
}

/// Parse an `@args` list: comma-delimited `name: type [in lo..=hi]` tokens.
fn parse_params(args: &str) -> Result<Vec<ParamSpec>, String> {
    let args = args.trim();
    if args.is_empty() {
        return Ok(Vec::new());
    }
    args.split(',').map(parse_param).collect()
}

fn parse_param(token: &str) -> Result<ParamSpec, String> {
    let token = token.trim();
    let (name, rest) = token
        .split_once(':')
        .ok_or_else(|| format!("parameter `{token}` is missing `name: type`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("parameter `{token}` has an empty name"));
    }

    let rest = rest.trim();
    let (ty_token, bounds_token) = match rest.split_once(" in ") {
        Some((ty, bounds)) => (ty.trim(), Some(bounds.trim())),
        None => (rest, None),
    };
    let ty = ParamType::from_token(ty_token)
        .ok_or_else(|| format!("unresolvable type `{ty_token}` for parameter `{name}`"))?;

    let bounds = match bounds_token {
        None => None,
        Some(bounds_token) => {
            if !ty.is_integer() {
                return Err(format!(
                    "bounds on non-integer parameter `{name}` ({ty})"
                ));
            }
            Some(parse_bounds(bounds_token, ty)?)
        }
    };

    Ok(ParamSpec {
        name: name.to_string(),
        ty,
        bounds,
    })
}

fn parse_bounds(token: &str, ty: ParamType) -> Result<Bounds, String> {
    let (lo, hi) = token
        .split_once("..=")
        .ok_or_else(|| format!("bad bounds `{token}` (expected `lo..=hi`)"))?;
    let min = parse_int(lo.trim()).ok_or_else(|| format!("bad lower bound `{lo}`"))?;
    let max = parse_int(hi.trim()).ok_or_else(|| format!("bad upper bound `{hi}`"))?;
    if min > max {
        return Err(format!("empty bounds `{token}`"));
    }
    let Some(intrinsic) = ty.intrinsic_bounds() else {
        return Err(format!("type {ty} does not accept bounds"));
    };
    if min < intrinsic.min || max > intrinsic.max {
        return Err(format!("bounds `{token}` exceed the range of {ty}"));
    }
    Ok(Bounds { min, max })
}

fn parse_response_hint(types: &str) -> Result<Vec<ParamType>, String> {
    let types = types.trim();
    if types.is_empty() {
        return Ok(Vec::new());
    }
    types
        .split(',')
        .map(|token| {
            let token = token.trim();
            ParamType::from_token(token)
                .ok_or_else(|| format!("unresolvable response type `{token}`"))
        })
        .collect()
}

fn parse_int(token: &str) -> Option<i128> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()
    } else if let Some(hex) = token.strip_prefix("-0x") {
        i128::from_str_radix(hex, 16).ok().map(|v| -v)
    } else {
        token.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_type_vocabulary() {
        assert_eq!(ParamType::from_token("uint8"), Some(ParamType::U8));
        assert_eq!(ParamType::from_token("float"), Some(ParamType::F64));
        assert_eq!(ParamType::from_token("hex"), Some(ParamType::Bytes));
        assert_eq!(ParamType::from_token("quaternion"), None);
    }

    #[test]
    fn test_parse_param_with_bounds() {
        let spec = parse_param(" level : u8 in 0..=100 ").unwrap();
        assert_eq!(spec.name, "level");
        assert_eq!(spec.ty, ParamType::U8);
        assert_eq!(spec.bounds, Some(Bounds { min: 0, max: 100 }));
    }

    #[test]
    fn test_parse_param_rejects_bounds_on_string() {
        let err = parse_param("label: str in 0..=10").unwrap_err();
        assert!(err.contains("non-integer"));
    }

    #[test]
    fn test_parse_param_rejects_out_of_range_bounds() {
        let err = parse_param("level: u8 in 0..=300").unwrap_err();
        assert!(err.contains("exceed"));
    }

    #[test]
    fn test_parse_declaration_full_block() {
        let body = vec![
            (2, "@args level: u8 in 0..=100, mode: u16".to_string()),
            (3, "@ready for_flight".to_string()),
            (4, "@resp u8, u32".to_string()),
            (5, "@doc Set the EPS output power level.".to_string()),
            (6, "@doc Second line.".to_string()),
        ];
        let def = parse_declaration(" SET_POWER 0x10", &body).unwrap();
        assert_eq!(def.id, TcmdId(0x10));
        assert_eq!(def.name, "SET_POWER");
        assert_eq!(def.arity(), 2);
        assert_eq!(def.readiness, ReadinessLevel::ForFlight);
        assert_eq!(
            def.response_hint,
            Some(vec![ParamType::U8, ParamType::U32])
        );
        assert_eq!(def.doc, "Set the EPS output power level.\nSecond line.");
    }

    #[test]
    fn test_strip_comment_decoration() {
        assert_eq!(strip_comment_decoration("  // @tcmd A 1"), "@tcmd A 1");
        assert_eq!(strip_comment_decoration(" * @args x: u8"), "@args x: u8");
        assert_eq!(strip_comment_decoration("# @end"), "@end");
        assert_eq!(strip_comment_decoration(" @doc text */"), "@doc text");
    }
}
