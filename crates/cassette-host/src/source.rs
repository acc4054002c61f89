//! Cassette sources: turning a path, URL, or buffer into a validated binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::LoaderConfig;
use crate::error::CassetteError;

/// WASM magic bytes: `\0asm`
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// File name used when the source does not carry one.
pub const DEFAULT_FILE_NAME: &str = "unknown_cassette.wasm";

/// Where a cassette binary comes from.
#[derive(Debug, Clone)]
pub enum CassetteSource {
    /// A `.wasm` file, or a `.wat` file assembled on load.
    File(PathBuf),
    /// An http(s) URL fetched with `reqwest`.
    Url(url::Url),
    /// An in-memory binary.
    Bytes {
        bytes: Vec<u8>,
        file_name: Option<String>,
    },
}

impl CassetteSource {
    pub fn bytes(bytes: impl Into<Vec<u8>>, file_name: impl Into<String>) -> Self {
        Self::Bytes {
            bytes: bytes.into(),
            file_name: Some(file_name.into()),
        }
    }

    /// Interpret a command-line argument as a URL when it parses as one with
    /// an http(s) scheme, otherwise as a path.
    pub fn parse(arg: &str) -> Self {
        match url::Url::parse(arg) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Url(url),
            _ => Self::File(PathBuf::from(arg)),
        }
    }

    /// Original file name of the cassette, used for ids and metadata fallbacks.
    pub fn file_name(&self) -> String {
        let name = match self {
            Self::File(path) => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string),
            Self::Url(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            Self::Bytes { file_name, .. } => file_name.clone(),
        };
        name.unwrap_or_else(|| DEFAULT_FILE_NAME.to_string())
    }
}

/// File name without its extension (`"notes.wasm"` → `"notes"`).
pub fn file_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(file_name)
        .to_string()
}

/// Obtain the raw bytes of a cassette.
pub async fn read_source(
    source: &CassetteSource,
    config: &LoaderConfig,
) -> Result<Vec<u8>, CassetteError> {
    let bytes = match source {
        CassetteSource::File(path) => {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                CassetteError::SourceUnavailable(format!("failed to read {}: {e}", path.display()))
            })?;
            let is_wat = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("wat"));
            if is_wat {
                wat::parse_bytes(&bytes)
                    .map_err(|e| CassetteError::CompileFailed(format!("invalid WAT: {e}")))?
                    .into_owned()
            } else {
                bytes
            }
        }
        CassetteSource::Url(url) => fetch(url, config).await?,
        CassetteSource::Bytes { bytes, .. } => bytes.clone(),
    };

    if bytes.len() as u64 > config.max_wasm_size {
        return Err(CassetteError::SourceUnavailable(format!(
            "cassette is {} bytes, exceeding the {} byte limit",
            bytes.len(),
            config.max_wasm_size
        )));
    }

    Ok(bytes)
}

async fn fetch(url: &url::Url, config: &LoaderConfig) -> Result<Vec<u8>, CassetteError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .build()
        .map_err(|e| CassetteError::SourceUnavailable(format!("http client: {e}")))?;

    let response = client
        .get(url.clone())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| CassetteError::SourceUnavailable(format!("failed to fetch {url}: {e}")))?;

    let body = response
        .bytes()
        .await
        .map_err(|e| CassetteError::SourceUnavailable(format!("failed to read {url}: {e}")))?;

    Ok(body.to_vec())
}

// ─── Binary validation ──────────────────────────────────────────────────

/// Kind of a declared import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportKind {
    Function,
    Global,
    Memory,
    Table,
    Tag,
}

/// One entry of a module's import table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportDescriptor {
    pub module: String,
    pub name: String,
    pub kind: ImportKind,
}

/// Validate a cassette binary and return its declared import table.
///
/// Checks the magic bytes, then walks every section with `wasmparser` so a
/// truncated or malformed module is rejected before compilation.
pub fn validate_wasm(bytes: &[u8]) -> Result<Vec<ImportDescriptor>, CassetteError> {
    use wasmparser::{Parser, Payload, TypeRef};

    if bytes.len() < 8 || &bytes[..4] != WASM_MAGIC {
        return Err(CassetteError::CompileFailed(
            "not a WebAssembly binary (bad magic bytes)".into(),
        ));
    }

    let mut imports = Vec::new();
    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload
            .map_err(|e| CassetteError::CompileFailed(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    CassetteError::CompileFailed(format!("failed to read import: {e}"))
                })?;
                let kind = match import.ty {
                    TypeRef::Func(_) => ImportKind::Function,
                    TypeRef::Global(_) => ImportKind::Global,
                    TypeRef::Memory(_) => ImportKind::Memory,
                    TypeRef::Table(_) => ImportKind::Table,
                    TypeRef::Tag(_) => ImportKind::Tag,
                };
                imports.push(ImportDescriptor {
                    module: import.module.to_string(),
                    name: import.name.to_string(),
                    kind,
                });
            }
        }
    }

    Ok(imports)
}
