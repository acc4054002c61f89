//! String marshalling across the linear-memory boundary.
//!
//! Strings the host writes are allocated through the cassette's own
//! allocator export and always carry a trailing NUL, so they work for both
//! pointer-only and pointer+length parameters. Strings the cassette returns
//! are read either from an explicit `(ptr, len)` pair or, when only a
//! pointer is given, as a length-prefixed or NUL-terminated region. Every
//! scan is bounded by `max_len`.

use wasmtime::{Func, FuncType, Memory, Store, Val, ValType};

use crate::error::{runtime_fault, CassetteError};
use crate::imports::HostState;

/// Alignment passed to allocators that take one.
const STRING_ALIGN: u64 = 1;

// ─── Guest functions ────────────────────────────────────────────────────

/// An export resolved once at load time, with its signature.
#[derive(Clone)]
pub struct GuestFn {
    name: String,
    func: Func,
    params: Vec<ValType>,
    results: Vec<ValType>,
}

impl std::fmt::Debug for GuestFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestFn")
            .field("name", &self.name)
            .field("params", &self.params.len())
            .field("results", &self.results.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn is_int(ty: &ValType) -> bool {
    matches!(ty, ValType::I32 | ValType::I64)
}

impl GuestFn {
    pub fn new(name: impl Into<String>, func: Func, ty: &FuncType) -> Self {
        Self {
            name: name.into(),
            func,
            params: ty.params().collect(),
            results: ty.results().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    /// True when every parameter and result is an integer.
    pub fn is_integer_only(&self) -> bool {
        self.params.iter().all(is_int) && self.results.iter().all(is_int)
    }

    /// Call with integer arguments; integer results are zero-extended.
    ///
    /// Arguments beyond the declared parameter count are dropped.
    pub fn call(&self, store: &mut Store<HostState>, args: &[u64]) -> Result<Vec<u64>, CassetteError> {
        let params: Vec<Val> = self
            .params
            .iter()
            .zip(args.iter().copied().chain(std::iter::repeat(0)))
            .map(|(ty, arg)| match ty {
                ValType::I64 => Val::I64(arg as i64),
                _ => Val::I32(arg as u32 as i32),
            })
            .collect();
        let mut results = vec![Val::I32(0); self.results.len()];

        self.func
            .call(&mut *store, &params, &mut results)
            .map_err(|e| runtime_fault(&self.name, e))?;

        results
            .iter()
            .map(|v| match v {
                Val::I32(i) => Ok(u64::from(*i as u32)),
                Val::I64(i) => Ok(*i as u64),
                other => Err(CassetteError::MarshallingFailed(format!(
                    "{} returned a non-integer value: {other:?}",
                    self.name
                ))),
            })
            .collect()
    }
}

// ─── Regions ────────────────────────────────────────────────────────────

/// Ownership token for a block of guest memory.
///
/// Not `Clone`: every region is consumed exactly once by
/// [`StringCodec::free`] or [`StringCodec::release`].
#[must_use = "guest regions must be freed"]
#[derive(Debug, PartialEq, Eq)]
pub struct GuestRegion {
    ptr: u64,
    size: u64,
    content_len: u64,
}

impl GuestRegion {
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Bytes owned, including any prefix or terminator.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes of string content.
    pub fn content_len(&self) -> u64 {
        self.content_len
    }

    /// Drop a token without freeing it, for an address another token
    /// already owns.
    pub(crate) fn forget(self) {}

    /// Take ownership of a string the guest returned but the host could not
    /// read, so it can still be freed.
    pub(crate) fn unread(string: StringRef) -> Self {
        let len = match string {
            StringRef::Explicit { len, .. } => len,
            StringRef::Pointer(_) => 0,
        };
        Self {
            ptr: string.ptr(),
            size: len,
            content_len: len,
        }
    }
}

/// How a returned string is located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringRef {
    /// Pointer only: length-prefixed or NUL-terminated.
    Pointer(u64),
    /// Explicit pointer and length.
    Explicit { ptr: u64, len: u64 },
}

impl StringRef {
    pub fn ptr(self) -> u64 {
        match self {
            Self::Pointer(ptr) | Self::Explicit { ptr, .. } => ptr,
        }
    }
}

/// Locate the bytes of a pointer-only string.
///
/// Returns `(content_start, content_len, region_size)` relative to `start`.
/// A NUL terminator within the first four bytes is ambiguous with a u32
/// little-endian length prefix; the prefix wins when it is in bounds, within
/// `max_len`, and covers a NUL-free body.
fn locate(data: &[u8], start: usize, max_len: usize) -> Result<(usize, usize, usize), CassetteError> {
    if start >= data.len() {
        return Err(CassetteError::MarshallingFailed(format!(
            "string pointer {start} is outside linear memory ({} bytes)",
            data.len()
        )));
    }

    let window_end = data.len().min(start.saturating_add(max_len).saturating_add(1));
    let window = &data[start..window_end];
    let terminated = match window.iter().position(|b| *b == 0) {
        Some(n) => Ok(n),
        None if window.len() > max_len => Err(CassetteError::MarshallingFailed(format!(
            "no terminator within {max_len} bytes"
        ))),
        None => Err(CassetteError::MarshallingFailed(
            "string runs past the end of linear memory".into(),
        )),
    };

    if let Ok(n) = terminated {
        if n >= 4 {
            return Ok((0, n, n + 1));
        }
    }

    if let Some(len) = length_prefix(data, start, max_len) {
        return Ok((4, len, len + 4));
    }

    terminated.map(|n| (0, n, n + 1))
}

fn length_prefix(data: &[u8], start: usize, max_len: usize) -> Option<usize> {
    let header: [u8; 4] = data.get(start..start.checked_add(4)?)?.try_into().ok()?;
    let len = u32::from_le_bytes(header) as usize;
    if len == 0 || len > max_len {
        return None;
    }
    let body = data.get(start + 4..(start + 4).checked_add(len)?)?;
    (!body.contains(&0)).then_some(len)
}

// ─── Codec ──────────────────────────────────────────────────────────────

/// Reads, writes, and frees strings in one cassette's linear memory.
#[derive(Debug, Clone)]
pub struct StringCodec {
    memory: Memory,
    alloc: Option<GuestFn>,
    dealloc: Option<GuestFn>,
    max_len: usize,
}

impl StringCodec {
    pub fn new(memory: Memory, alloc: Option<GuestFn>, dealloc: Option<GuestFn>, max_len: usize) -> Self {
        Self {
            memory,
            alloc,
            dealloc,
            max_len,
        }
    }

    pub fn can_write(&self) -> bool {
        self.alloc.is_some()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Allocate guest memory for `text` and copy it in, NUL-terminated.
    pub fn write(&self, store: &mut Store<HostState>, text: &str) -> Result<GuestRegion, CassetteError> {
        let alloc = self.alloc.as_ref().ok_or_else(|| {
            CassetteError::AllocationFailed("cassette exports no allocator".into())
        })?;
        if text.len() > self.max_len {
            return Err(CassetteError::MarshallingFailed(format!(
                "string of {} bytes exceeds the {} byte limit",
                text.len(),
                self.max_len
            )));
        }

        let size = text.len() as u64 + 1;
        let ptr = alloc
            .call(store, &[size, STRING_ALIGN])?
            .first()
            .copied()
            .unwrap_or(0);
        if ptr == 0 {
            return Err(CassetteError::AllocationFailed(format!(
                "{} returned a null pointer",
                alloc.name()
            )));
        }
        let region = GuestRegion {
            ptr,
            size,
            content_len: text.len() as u64,
        };

        let mut bytes = Vec::with_capacity(size as usize);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        if let Err(e) = self.memory.write(&mut *store, ptr as usize, &bytes) {
            self.release(store, region);
            return Err(CassetteError::MarshallingFailed(format!(
                "failed to write {size} bytes at {ptr}: {e}"
            )));
        }

        Ok(region)
    }

    /// Copy the raw bytes of a returned string.
    pub fn read_bytes(
        &self,
        store: &Store<HostState>,
        string: StringRef,
    ) -> Result<(Vec<u8>, GuestRegion), CassetteError> {
        let data = self.memory.data(store);
        match string {
            StringRef::Explicit { ptr: 0, .. } | StringRef::Pointer(0) => Err(
                CassetteError::MarshallingFailed("null string pointer".into()),
            ),
            StringRef::Explicit { ptr, len } => {
                if len as usize > self.max_len {
                    return Err(CassetteError::MarshallingFailed(format!(
                        "string of {len} bytes exceeds the {} byte limit",
                        self.max_len
                    )));
                }
                let start = ptr as usize;
                let bytes = start
                    .checked_add(len as usize)
                    .and_then(|end| data.get(start..end))
                    .ok_or_else(|| {
                        CassetteError::MarshallingFailed(format!(
                            "string at {ptr} with length {len} is outside linear memory"
                        ))
                    })?;
                Ok((
                    bytes.to_vec(),
                    GuestRegion {
                        ptr,
                        size: len,
                        content_len: len,
                    },
                ))
            }
            StringRef::Pointer(ptr) => {
                let start = ptr as usize;
                let (offset, len, size) = locate(data, start, self.max_len)?;
                let bytes = data[start + offset..start + offset + len].to_vec();
                Ok((
                    bytes,
                    GuestRegion {
                        ptr,
                        size: size as u64,
                        content_len: len as u64,
                    },
                ))
            }
        }
    }

    /// Read and decode a returned string as UTF-8.
    pub fn read(
        &self,
        store: &Store<HostState>,
        string: StringRef,
    ) -> Result<(String, GuestRegion), CassetteError> {
        let (bytes, region) = self.read_bytes(store, string)?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok((text, region)),
            Err(e) => Err(CassetteError::MarshallingFailed(format!(
                "string at {} is not valid UTF-8: {e}",
                region.ptr
            ))),
        }
    }

    /// Hand a region back to the cassette's deallocator.
    ///
    /// A cassette without a deallocator manages its own memory, so this is a
    /// no-op rather than an error.
    pub fn free(&self, store: &mut Store<HostState>, region: GuestRegion) -> Result<(), CassetteError> {
        let Some(dealloc) = &self.dealloc else {
            return Ok(());
        };
        if region.ptr == 0 {
            return Ok(());
        }
        dealloc.call(store, &[region.ptr, region.size, STRING_ALIGN])?;
        Ok(())
    }

    /// Free a region, logging instead of returning any failure.
    pub fn release(&self, store: &mut Store<HostState>, region: GuestRegion) {
        let ptr = region.ptr;
        if let Err(e) = self.free(store, region) {
            tracing::error!(
                cassette = %store.data().cassette_id(),
                ptr,
                "failed to free guest memory: {e}"
            );
        }
    }
}
