//! Import environment for cassettes.
//!
//! Resolution runs in two phases. The base environment supplies what the
//! host knows how to provide (linear memory, diagnostic sinks, the legacy
//! string/throw helpers). The resolver then walks the module's declared
//! imports and stubs every function or global the base environment did not
//! cover, so an unrecognised import never fails instantiation on its own.

use std::collections::HashSet;

use serde::Serialize;
use wasmtime::{
    Caller, Engine, Extern, Func, FuncType, Global, Linker, Memory, MemoryType, Module, Store,
    Val, ValType,
};

use crate::config::LoaderConfig;
use crate::error::{CassetteError, GuestAbort};
use crate::source::ImportKind;

/// Longest guest diagnostic message rendered into the host log.
const MAX_GUEST_LOG_LEN: usize = 2048;

// ─── Store state ────────────────────────────────────────────────────────

/// Per-instance data carried by the wasmtime store.
#[derive(Debug)]
pub struct HostState {
    cassette_id: String,
    /// Linear memory the host supplied, if the module imports one.
    memory: Option<Memory>,
}

impl HostState {
    pub fn new(cassette_id: impl Into<String>) -> Self {
        Self {
            cassette_id: cassette_id.into(),
            memory: None,
        }
    }

    pub fn cassette_id(&self) -> &str {
        &self.cassette_id
    }

    pub fn imported_memory(&self) -> Option<Memory> {
        self.memory
    }
}

// ─── Diagnostics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Where a synthesized function stub sends its calls.
///
/// The return contract is identical for every sink: all results are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StubSink {
    /// Name looks like a logger (`log`, `print`).
    Log,
    /// Name looks like an error reporter (`error`, `panic`).
    Error,
    /// Anything else: a silent no-op, traced at debug level.
    Silent,
    /// Global slots have no sink.
    None,
}

impl StubSink {
    pub fn for_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("log") || lower.contains("print") {
            Self::Log
        } else if lower.contains("error") || lower.contains("panic") {
            Self::Error
        } else {
            Self::Silent
        }
    }

    fn level(self) -> DiagnosticLevel {
        match self {
            Self::Log => DiagnosticLevel::Info,
            Self::Error => DiagnosticLevel::Error,
            Self::Silent | Self::None => DiagnosticLevel::Debug,
        }
    }
}

/// An import the resolver had to synthesize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StubbedImport {
    pub module: String,
    pub name: String,
    pub kind: ImportKind,
    pub sink: StubSink,
}

fn emit(level: DiagnosticLevel, cassette: &str, source: &str, message: &str) {
    match level {
        DiagnosticLevel::Debug => {
            tracing::debug!(target: "cassette::guest", cassette = %cassette, import = %source, "{message}")
        }
        DiagnosticLevel::Info => {
            tracing::info!(target: "cassette::guest", cassette = %cassette, import = %source, "{message}")
        }
        DiagnosticLevel::Warn => {
            tracing::warn!(target: "cassette::guest", cassette = %cassette, import = %source, "{message}")
        }
        DiagnosticLevel::Error => {
            tracing::error!(target: "cassette::guest", cassette = %cassette, import = %source, "{message}")
        }
    }
}

/// Render guest call arguments for the log.
///
/// A `(ptr, len)` pair of i32s that decodes to UTF-8 in guest memory is
/// shown as text; everything else is shown as raw numbers.
fn render_args(caller: &mut Caller<'_, HostState>, params: &[Val]) -> String {
    if let [Val::I32(ptr), Val::I32(len)] = params {
        if let Some(text) = read_guest_str(caller, *ptr, *len) {
            return text;
        }
    }
    let rendered: Vec<String> = params
        .iter()
        .map(|v| match v {
            Val::I32(i) => i.to_string(),
            Val::I64(i) => i.to_string(),
            Val::F32(bits) => f32::from_bits(*bits).to_string(),
            Val::F64(bits) => f64::from_bits(*bits).to_string(),
            other => format!("{other:?}"),
        })
        .collect();
    rendered.join(" ")
}

fn caller_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .or(caller.data().memory)
}

/// Decode `len` bytes at `ptr` from the caller's memory.
fn read_guest_str(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Option<String> {
    let memory = caller_memory(caller)?;
    let start = ptr as u32 as usize;
    let len = (len as u32 as usize).min(MAX_GUEST_LOG_LEN);
    let bytes = memory.data(&*caller).get(start..start.checked_add(len)?)?;
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

/// Zero value of a wasm type; references become null.
pub(crate) fn zero_value(ty: &ValType) -> Val {
    match ty {
        ValType::I32 => Val::I32(0),
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(0),
        ValType::F64 => Val::F64(0),
        ValType::V128 => Val::V128(0u128.into()),
        ValType::Ref(r) => Val::null_ref(r.heap_type()),
    }
}

fn fill_zero(results: &mut [Val], types: &[ValType]) {
    for (slot, ty) in results.iter_mut().zip(types) {
        *slot = zero_value(ty);
    }
}

// ─── Base environment ───────────────────────────────────────────────────

/// Imports the host supplies natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostImport {
    Memory,
    Func(HostFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostFn {
    Log(DiagnosticLevel),
    Abort,
    StringNew,
    Throw,
}

const WBINDGEN_MODULE: &str = "__wbindgen_placeholder__";

fn host_import(module: &str, name: &str) -> Option<HostImport> {
    match (module, name) {
        ("env", "memory") => Some(HostImport::Memory),
        ("env", "log") => Some(HostImport::Func(HostFn::Log(DiagnosticLevel::Info))),
        ("env", "warn") => Some(HostImport::Func(HostFn::Log(DiagnosticLevel::Warn))),
        ("env", "error") => Some(HostImport::Func(HostFn::Log(DiagnosticLevel::Error))),
        ("env", "abort") => Some(HostImport::Func(HostFn::Abort)),
        (WBINDGEN_MODULE, "__wbindgen_string_new") => Some(HostImport::Func(HostFn::StringNew)),
        (WBINDGEN_MODULE, "__wbindgen_throw") => Some(HostImport::Func(HostFn::Throw)),
        _ => None,
    }
}

fn host_func(store: &mut Store<HostState>, ty: FuncType, host: HostFn, source: String) -> Func {
    let results: Vec<ValType> = ty.results().collect();
    Func::new(&mut *store, ty, move |mut caller, params, out| {
        let id = caller.data().cassette_id.clone();
        match host {
            HostFn::Log(level) => {
                let message = render_args(&mut caller, params);
                emit(level, &id, &source, &message);
            }
            HostFn::Abort => {
                let message = render_args(&mut caller, params);
                emit(DiagnosticLevel::Error, &id, &source, &format!("abort: {message}"));
                return Err(wasmtime::Error::new(GuestAbort(message)));
            }
            HostFn::StringNew => {
                let message = render_args(&mut caller, params);
                tracing::trace!(target: "cassette::guest", cassette = %id, "string_new: {message}");
            }
            HostFn::Throw => {
                let message = render_args(&mut caller, params);
                emit(DiagnosticLevel::Error, &id, &source, &format!("throw: {message}"));
                return Err(wasmtime::Error::new(GuestAbort(message)));
            }
        }
        fill_zero(out, &results);
        Ok(())
    })
}

fn host_memory(
    store: &mut Store<HostState>,
    ty: &MemoryType,
    config: &LoaderConfig,
) -> Result<Option<Memory>, CassetteError> {
    if ty.is_shared() {
        // Shared memories need a threads-enabled engine; leave it unresolved.
        return Ok(None);
    }
    let mem_ty = if ty.is_64() {
        ty.clone()
    } else {
        let initial = u64::from(config.memory_initial_pages).max(ty.minimum());
        let initial = ty.maximum().map_or(initial, |max| initial.min(max));
        MemoryType::new(initial as u32, ty.maximum().map(|m| m as u32))
    };
    let memory = Memory::new(&mut *store, mem_ty)
        .map_err(|e| CassetteError::InstantiateFailed(format!("failed to create memory: {e}")))?;
    if store.data().memory.is_none() {
        store.data_mut().memory = Some(memory);
    }
    Ok(Some(memory))
}

/// Linker plus bookkeeping of which imports are already satisfied.
pub struct ImportEnvironment {
    linker: Linker<HostState>,
    satisfied: HashSet<(String, String)>,
}

impl ImportEnvironment {
    fn define(
        &mut self,
        store: &Store<HostState>,
        module: &str,
        name: &str,
        item: impl Into<Extern>,
    ) -> Result<(), CassetteError> {
        self.linker.define(store, module, name, item).map_err(|e| {
            CassetteError::InstantiateFailed(format!("failed to define {module}.{name}: {e}"))
        })?;
        self.satisfied.insert((module.to_string(), name.to_string()));
        Ok(())
    }

    pub fn is_satisfied(&self, module: &str, name: &str) -> bool {
        self.satisfied
            .contains(&(module.to_string(), name.to_string()))
    }

    /// Instantiate the module against everything defined so far.
    pub fn instantiate(
        &self,
        store: &mut Store<HostState>,
        module: &Module,
    ) -> Result<wasmtime::Instance, CassetteError> {
        self.linker
            .instantiate(&mut *store, module)
            .map_err(|e| CassetteError::InstantiateFailed(format!("{e:#}")))
    }
}

/// Phase one: supply the imports the host natively provides.
///
/// Only imports the module actually declares are defined, each built
/// against its declared type so signature differences between ABI flavours
/// never cause a link error.
pub fn base_environment(
    engine: &Engine,
    store: &mut Store<HostState>,
    module: &Module,
    config: &LoaderConfig,
) -> Result<ImportEnvironment, CassetteError> {
    let mut env = ImportEnvironment {
        linker: Linker::new(engine),
        satisfied: HashSet::new(),
    };

    for import in module.imports() {
        let (module_name, name) = (import.module(), import.name());
        if env.is_satisfied(module_name, name) {
            continue;
        }
        let Some(host) = host_import(module_name, name) else {
            continue;
        };
        match (host, import.ty()) {
            (HostImport::Memory, wasmtime::ExternType::Memory(ty)) => {
                if let Some(memory) = host_memory(store, &ty, config)? {
                    env.define(store, module_name, name, memory)?;
                }
            }
            (HostImport::Func(host), wasmtime::ExternType::Func(ty)) => {
                let func = host_func(store, ty, host, format!("{module_name}.{name}"));
                env.define(store, module_name, name, func)?;
            }
            // Known name with an unexpected kind: let the resolver stub it.
            _ => {}
        }
    }

    Ok(env)
}

// ─── Resolver ───────────────────────────────────────────────────────────

fn stub_func(store: &mut Store<HostState>, ty: FuncType, sink: StubSink, source: String) -> Func {
    let results: Vec<ValType> = ty.results().collect();
    Func::new(&mut *store, ty, move |mut caller, params, out| {
        let id = caller.data().cassette_id.clone();
        let args = render_args(&mut caller, params);
        emit(sink.level(), &id, &source, &format!("stub called with: {args}"));
        fill_zero(out, &results);
        Ok(())
    })
}

/// Phase two: synthesize stubs for every import the environment lacks.
///
/// Functions get a zero-returning stub whose diagnostic sink is picked from
/// the import name; globals get a zero-valued slot; memories get a fresh
/// memory of the declared shape. Tables, tags, and shared memories are left
/// unresolved and surface as an instantiation failure.
pub fn resolve_missing(
    env: &mut ImportEnvironment,
    store: &mut Store<HostState>,
    module: &Module,
    config: &LoaderConfig,
) -> Result<Vec<StubbedImport>, CassetteError> {
    let mut stubbed = Vec::new();

    for import in module.imports() {
        let (module_name, name) = (import.module(), import.name());
        if env.is_satisfied(module_name, name) {
            continue;
        }
        let source = format!("{module_name}.{name}");

        let (kind, sink) = match import.ty() {
            wasmtime::ExternType::Func(ty) => {
                let sink = StubSink::for_name(name);
                let func = stub_func(store, ty, sink, source.clone());
                env.define(store, module_name, name, func)?;
                (ImportKind::Function, sink)
            }
            wasmtime::ExternType::Global(ty) => {
                let zero = zero_value(ty.content());
                let global = Global::new(&mut *store, ty, zero).map_err(|e| {
                    CassetteError::InstantiateFailed(format!("failed to stub {source}: {e}"))
                })?;
                env.define(store, module_name, name, global)?;
                (ImportKind::Global, StubSink::None)
            }
            wasmtime::ExternType::Memory(ty) => match host_memory(store, &ty, config)? {
                Some(memory) => {
                    env.define(store, module_name, name, memory)?;
                    (ImportKind::Memory, StubSink::None)
                }
                None => {
                    tracing::warn!(
                        cassette = %store.data().cassette_id,
                        import = %source,
                        "cannot supply shared memory import"
                    );
                    continue;
                }
            },
            other => {
                tracing::warn!(
                    cassette = %store.data().cassette_id,
                    import = %source,
                    "cannot stub import of this kind: {other:?}"
                );
                continue;
            }
        };

        tracing::debug!(
            cassette = %store.data().cassette_id,
            import = %source,
            ?kind,
            "stubbed missing import"
        );
        stubbed.push(StubbedImport {
            module: module_name.to_string(),
            name: name.to_string(),
            kind,
            sink,
        });
    }

    Ok(stubbed)
}
