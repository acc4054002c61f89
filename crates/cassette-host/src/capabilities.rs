//! Capability probe.
//!
//! Export names vary between toolchains (`req`, `cassette_req`,
//! `__wbg_req`, ...) and so do signatures (pointer-only vs. pointer+length).
//! [`probe`] resolves every logical operation once, right after
//! instantiation, into a [`Dispatch`] table the handle calls through. A
//! matched export whose signature cannot be driven is rejected here rather
//! than at its first call.

use serde::Serialize;
use wasmtime::{Func, FuncType, Instance, Memory, Store};

use crate::error::CassetteError;
use crate::imports::HostState;
use crate::memory::{GuestFn, StringRef};

/// Bytes requested per chunk from chunked transfer exports.
pub const CHUNK_LEN: u64 = 1000;

// ─── Name table ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Req,
    Close,
    Describe,
    Schema,
    DescribeSize,
    DescribeChunk,
    SchemaSize,
    SchemaChunk,
    Alloc,
    Dealloc,
}

/// Exact names tried first, then a case-insensitive pattern, minus rejects.
struct ExportRule {
    exact: &'static [&'static str],
    pattern: &'static str,
    reject: &'static [&'static str],
}

const fn rule(
    exact: &'static [&'static str],
    pattern: &'static str,
    reject: &'static [&'static str],
) -> ExportRule {
    ExportRule {
        exact,
        pattern,
        reject,
    }
}

impl Op {
    fn rule(self) -> ExportRule {
        match self {
            Op::Req => rule(&["req"], "req", &[]),
            Op::Close => rule(&["close"], "close", &[]),
            Op::Describe => rule(&["describe"], "describe", &["size", "chunk"]),
            Op::Schema => rule(&["get_schema"], "schema", &["size", "chunk"]),
            Op::DescribeSize => rule(&["get_description_size"], "description_size", &[]),
            Op::DescribeChunk => rule(&["get_description_chunk"], "description_chunk", &[]),
            Op::SchemaSize => rule(&["get_schema_size"], "schema_size", &[]),
            Op::SchemaChunk => rule(&["get_schema_chunk"], "schema_chunk", &[]),
            Op::Alloc => rule(
                &["alloc", "allocate", "malloc", "__wbindgen_malloc", "alloc_string"],
                "alloc",
                &["dealloc", "realloc", "free"],
            ),
            Op::Dealloc => rule(
                &["dealloc", "deallocate", "free", "__wbindgen_free", "dealloc_string"],
                "dealloc",
                &[],
            ),
        }
    }
}

/// Equal, `_`-suffixed, suffixed, or prefixed, ignoring case.
fn matches_pattern(export: &str, pattern: &str) -> bool {
    let lower = export.to_lowercase();
    lower == pattern
        || lower.ends_with(&format!("_{pattern}"))
        || lower.ends_with(pattern)
        || lower.starts_with(pattern)
}

/// A function export with its signature.
struct ExportedFn {
    name: String,
    func: Func,
    ty: FuncType,
}

impl ExportRule {
    /// Candidate exports in priority order.
    fn candidates<'a>(&self, exports: &'a [ExportedFn]) -> Vec<&'a ExportedFn> {
        let mut found: Vec<&ExportedFn> = self
            .exact
            .iter()
            .filter_map(|name| exports.iter().find(|e| e.name == *name))
            .collect();
        for export in exports {
            let lower = export.name.to_lowercase();
            if self.reject.iter().any(|r| lower.contains(r)) {
                continue;
            }
            if matches_pattern(&export.name, self.pattern)
                && !found.iter().any(|f| f.name == export.name)
            {
                found.push(export);
            }
        }
        found
    }
}

// ─── Signatures ─────────────────────────────────────────────────────────

/// A string-returning export and how to drive it.
#[derive(Debug, Clone)]
pub(crate) struct TextExport {
    func: GuestFn,
    /// Takes `(ptr, len)` instead of `(ptr)` for its input string.
    takes_len: bool,
    /// Returns `(ptr, len)` instead of a bare pointer.
    returns_len: bool,
}

impl TextExport {
    pub(crate) fn name(&self) -> &str {
        self.func.name()
    }

    pub(crate) fn takes_len(&self) -> bool {
        self.takes_len
    }

    /// Call the export; `None` when it returned a null pointer.
    pub(crate) fn call(
        &self,
        store: &mut Store<HostState>,
        args: &[u64],
    ) -> Result<Option<StringRef>, CassetteError> {
        let results = self.func.call(store, args)?;
        let ptr = results.first().copied().unwrap_or(0);
        if ptr == 0 {
            return Ok(None);
        }
        Ok(Some(if self.returns_len {
            StringRef::Explicit {
                ptr,
                len: results.get(1).copied().unwrap_or(0),
            }
        } else {
            StringRef::Pointer(ptr)
        }))
    }
}

fn returns_text(func: &GuestFn) -> Option<bool> {
    match func.result_count() {
        1 => Some(false),
        2 => Some(true),
        _ => None,
    }
}

/// Validate the signature of a candidate for `op`.
fn shape(op: Op, func: GuestFn) -> Option<Shaped> {
    if !func.is_integer_only() {
        return None;
    }
    let params = func.param_count();
    match op {
        Op::Req | Op::Close => {
            let returns_len = returns_text(&func)?;
            matches!(params, 1 | 2).then(|| Shaped::Text(TextExport {
                takes_len: params == 2,
                returns_len,
                func,
            }))
        }
        Op::Describe | Op::Schema => {
            let returns_len = returns_text(&func)?;
            (params == 0).then(|| Shaped::Text(TextExport {
                takes_len: false,
                returns_len,
                func,
            }))
        }
        Op::DescribeChunk | Op::SchemaChunk => {
            let returns_len = returns_text(&func)?;
            (params == 2).then(|| Shaped::Text(TextExport {
                takes_len: false,
                returns_len,
                func,
            }))
        }
        Op::DescribeSize | Op::SchemaSize => {
            (params == 0 && func.result_count() == 1).then_some(Shaped::Plain(func))
        }
        Op::Alloc => {
            (matches!(params, 1 | 2) && func.result_count() == 1).then_some(Shaped::Plain(func))
        }
        Op::Dealloc => (matches!(params, 1..=3)).then_some(Shaped::Plain(func)),
    }
}

enum Shaped {
    Text(TextExport),
    Plain(GuestFn),
}

// ─── Dispatch table ─────────────────────────────────────────────────────

/// How `describe` or `get_schema` text is fetched.
#[derive(Debug, Clone)]
pub(crate) enum Transfer {
    Chunked { size: GuestFn, chunk: TextExport },
    Direct(TextExport),
}

impl Transfer {
    fn convention(&self) -> CallingConvention {
        match self {
            Self::Chunked { size, chunk } => CallingConvention::Chunked {
                size_export: size.name().to_string(),
                chunk_export: chunk.name().to_string(),
            },
            Self::Direct(export) => CallingConvention::Direct {
                export: export.name().to_string(),
            },
        }
    }
}

/// Every export the handle calls, resolved once.
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub memory: Memory,
    pub req: TextExport,
    pub close: Option<TextExport>,
    pub describe: Option<Transfer>,
    pub schema: Option<Transfer>,
    pub alloc: Option<GuestFn>,
    pub dealloc: Option<GuestFn>,
}

/// Transfer strategy used for one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "convention", rename_all = "lowercase")]
pub enum CallingConvention {
    Chunked {
        size_export: String,
        chunk_export: String,
    },
    Direct {
        export: String,
    },
}

/// Serialisable summary of a cassette's resolved exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub req: CallingConvention,
    pub close: Option<CallingConvention>,
    pub describe: Option<CallingConvention>,
    pub schema: Option<CallingConvention>,
    pub alloc: Option<String>,
    pub dealloc: Option<String>,
}

impl Capabilities {
    pub fn has_close(&self) -> bool {
        self.close.is_some()
    }
}

impl Dispatch {
    pub(crate) fn capabilities(&self) -> Capabilities {
        let direct = |e: &TextExport| CallingConvention::Direct {
            export: e.name().to_string(),
        };
        Capabilities {
            req: direct(&self.req),
            close: self.close.as_ref().map(direct),
            describe: self.describe.as_ref().map(Transfer::convention),
            schema: self.schema.as_ref().map(Transfer::convention),
            alloc: self.alloc.as_ref().map(|f| f.name().to_string()),
            dealloc: self.dealloc.as_ref().map(|f| f.name().to_string()),
        }
    }
}

// ─── Probe ──────────────────────────────────────────────────────────────

struct Probe {
    cassette_id: String,
    exports: Vec<ExportedFn>,
}

impl Probe {
    /// First candidate for `op` with a usable signature.
    fn resolve(&self, op: Op) -> Option<Shaped> {
        let mut rejected = Vec::new();
        for export in op.rule().candidates(&self.exports) {
            let guest = GuestFn::new(export.name.clone(), export.func, &export.ty);
            match shape(op, guest) {
                Some(shaped) => return Some(shaped),
                None => rejected.push(export.name.as_str()),
            }
        }
        if !rejected.is_empty() {
            tracing::warn!(
                cassette = %self.cassette_id,
                ?op,
                exports = ?rejected,
                "ignoring exports with unsupported signatures"
            );
        }
        None
    }

    fn text(&self, op: Op) -> Option<TextExport> {
        match self.resolve(op)? {
            Shaped::Text(export) => Some(export),
            Shaped::Plain(_) => None,
        }
    }

    fn plain(&self, op: Op) -> Option<GuestFn> {
        match self.resolve(op)? {
            Shaped::Plain(func) => Some(func),
            Shaped::Text(_) => None,
        }
    }

    /// Chunked pair if both halves exist, otherwise the direct export.
    fn transfer(&self, size: Op, chunk: Op, direct: Op) -> Option<Transfer> {
        if let (Some(size), Some(chunk)) = (self.plain(size), self.text(chunk)) {
            return Some(Transfer::Chunked { size, chunk });
        }
        self.text(direct).map(Transfer::Direct)
    }
}

fn find_memory(store: &mut Store<HostState>, instance: &Instance) -> Option<Memory> {
    if let Some(memory) = instance.get_memory(&mut *store, "memory") {
        return Some(memory);
    }
    let exported = instance
        .exports(&mut *store)
        .find_map(|export| export.into_memory());
    exported.or_else(|| store.data().imported_memory())
}

/// Inspect a freshly instantiated cassette and build its dispatch table.
pub(crate) fn probe(store: &mut Store<HostState>, instance: &Instance) -> Result<Dispatch, CassetteError> {
    let memory = find_memory(store, instance)
        .ok_or_else(|| CassetteError::MissingRequiredExport("linear memory".into()))?;

    let funcs: Vec<(String, Func)> = instance
        .exports(&mut *store)
        .filter_map(|export| {
            let name = export.name().to_string();
            export.into_func().map(|func| (name, func))
        })
        .collect();
    let exports = funcs
        .into_iter()
        .map(|(name, func)| ExportedFn {
            ty: func.ty(&*store),
            name,
            func,
        })
        .collect();

    let probe = Probe {
        cassette_id: store.data().cassette_id().to_string(),
        exports,
    };

    let req = probe.text(Op::Req).ok_or_else(|| {
        CassetteError::MissingRequiredExport("req (no export with a usable signature)".into())
    })?;

    let dispatch = Dispatch {
        memory,
        close: probe.text(Op::Close),
        describe: probe.transfer(Op::DescribeSize, Op::DescribeChunk, Op::Describe),
        schema: probe.transfer(Op::SchemaSize, Op::SchemaChunk, Op::Schema),
        alloc: probe.plain(Op::Alloc),
        dealloc: probe.plain(Op::Dealloc),
        req,
    };

    tracing::debug!(
        cassette = %probe.cassette_id,
        req = %dispatch.req.name(),
        close = ?dispatch.close.as_ref().map(TextExport::name),
        alloc = ?dispatch.alloc.as_ref().map(GuestFn::name),
        "resolved cassette exports"
    );

    Ok(dispatch)
}
