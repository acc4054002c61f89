//! The loaded cassette handle.

use serde::Serialize;
use serde_json::Value;
use wasmtime::{Instance, Store};

use crate::capabilities::{Capabilities, Dispatch, TextExport, Transfer, CHUNK_LEN};
use crate::dedup::{is_subscription_start, EventDeduplicator};
use crate::error::CassetteError;
use crate::imports::{HostState, StubbedImport};
use crate::memory::{GuestRegion, StringCodec};
use crate::normalize::{
    normalize_close, normalize_response, NormalizedMessage, CLOSE_NOT_IMPLEMENTED, EMPTY_RESPONSE,
    UNSUPPORTED_MESSAGE,
};
use crate::source::file_stem;

/// Schema returned when a cassette exports none.
pub const EMPTY_SCHEMA: &str = "{}";

const NO_DESCRIPTION: &str = "No description available";
const UNPARSABLE_DESCRIPTION: &str = "Error parsing description";
const UNKNOWN_VERSION: &str = "unknown";

/// Display metadata read from a cassette's `describe` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub version: String,
}

impl Metadata {
    /// Placeholder metadata derived from the file name.
    pub fn fallback(file_name: &str, description: &str) -> Self {
        Self {
            name: file_stem(file_name),
            description: description.to_string(),
            version: UNKNOWN_VERSION.to_string(),
        }
    }

    /// Read `name`, `description`, and `version` from the top level of the
    /// describe JSON, or from a nested `metadata` object.
    pub fn from_describe(describe: Result<String, CassetteError>, file_name: &str) -> Self {
        let text = match describe {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(file = %file_name, "failed to get description: {e}");
                return Self::fallback(file_name, NO_DESCRIPTION);
            }
        };
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(file = %file_name, "failed to parse description JSON: {e}");
                return Self::fallback(file_name, UNPARSABLE_DESCRIPTION);
            }
        };

        let field = |key: &str| {
            [value.get(key), value.get("metadata").and_then(|m| m.get(key))]
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .find(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            name: field("name").unwrap_or_else(|| file_stem(file_name)),
            description: field("description").unwrap_or_else(|| NO_DESCRIPTION.to_string()),
            version: field("version").unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
        }
    }
}

/// A loaded, probed cassette.
///
/// Owns the wasmtime store, and through it the instance and its linear
/// memory; dropping the handle releases all of them. Every operation takes
/// `&mut self`, so at most one export of an instance runs at a time.
pub struct Cassette {
    id: String,
    file_name: String,
    metadata: Metadata,
    store: Store<HostState>,
    instance: Instance,
    dispatch: Dispatch,
    codec: StringCodec,
    dedup: Option<EventDeduplicator>,
    stubbed: Vec<StubbedImport>,
}

impl std::fmt::Debug for Cassette {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cassette")
            .field("id", &self.id)
            .field("file_name", &self.file_name)
            .field("metadata", &self.metadata)
            .field("capabilities", &self.capabilities())
            .finish_non_exhaustive()
    }
}

impl Cassette {
    pub(crate) fn new(
        file_name: String,
        store: Store<HostState>,
        instance: Instance,
        dispatch: Dispatch,
        stubbed: Vec<StubbedImport>,
        max_string_len: usize,
        deduplicate_events: bool,
    ) -> Self {
        let codec = StringCodec::new(
            dispatch.memory,
            dispatch.alloc.clone(),
            dispatch.dealloc.clone(),
            max_string_len,
        );
        Self {
            id: store.data().cassette_id().to_string(),
            metadata: Metadata::fallback(&file_name, NO_DESCRIPTION),
            file_name,
            store,
            instance,
            dispatch,
            codec,
            dedup: deduplicate_events.then(EventDeduplicator::new),
            stubbed,
        }
    }

    pub(crate) fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn description(&self) -> &str {
        &self.metadata.description
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn capabilities(&self) -> Capabilities {
        self.dispatch.capabilities()
    }

    /// Imports the loader had to synthesize for this cassette.
    pub fn stubbed_imports(&self) -> &[StubbedImport] {
        &self.stubbed
    }

    /// Identifiers seen in the current subscription, if deduplicating.
    pub fn deduplicator(&self) -> Option<&EventDeduplicator> {
        self.dedup.as_ref()
    }

    /// Current value of an exported i32 global.
    pub fn global_i32(&mut self, name: &str) -> Option<i32> {
        self.instance
            .get_global(&mut self.store, name)
            .and_then(|g| g.get(&mut self.store).i32())
    }

    /// Raw description JSON.
    pub fn describe(&mut self) -> Result<String, CassetteError> {
        match &self.dispatch.describe {
            Some(transfer) => fetch(&mut self.store, &self.codec, transfer),
            None => Err(CassetteError::MissingRequiredExport("describe".into())),
        }
    }

    /// Raw schema JSON; `"{}"` when the cassette exports no schema.
    pub fn get_schema(&mut self) -> Result<String, CassetteError> {
        match &self.dispatch.schema {
            Some(transfer) => fetch(&mut self.store, &self.codec, transfer),
            None => {
                tracing::debug!(cassette = %self.id, "no schema export, returning empty schema");
                Ok(EMPTY_SCHEMA.to_string())
            }
        }
    }

    /// Run a request through the cassette and normalize the answer.
    pub fn req(&mut self, request: &str) -> NormalizedMessage {
        if let Some(dedup) = self.dedup.as_mut() {
            if is_subscription_start(request) {
                tracing::debug!(cassette = %self.id, "new subscription, resetting event tracker");
                dedup.reset();
            }
        }

        match call_text(
            &mut self.store,
            &self.codec,
            &self.dispatch.req,
            request,
            "request",
        ) {
            Ok(text) => normalize_response(&text, self.dedup.as_mut()),
            Err(notice) => notice,
        }
    }

    /// Close a subscription.
    pub fn close(&mut self, request: &str) -> NormalizedMessage {
        let Some(export) = &self.dispatch.close else {
            tracing::debug!(cassette = %self.id, "close not implemented by cassette");
            return NormalizedMessage::notice(CLOSE_NOT_IMPLEMENTED);
        };
        match call_text(&mut self.store, &self.codec, export, request, "close request") {
            Ok(text) => normalize_close(&text),
            Err(notice) => notice,
        }
    }

    /// Route a client message by its tag: `REQ` to [`req`](Self::req),
    /// `CLOSE` to [`close`](Self::close).
    pub fn send(&mut self, message: &str) -> NormalizedMessage {
        let tag = match serde_json::from_str::<Value>(message) {
            Ok(Value::Array(items)) => items.first().and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        match tag.as_deref() {
            Some("REQ") => self.req(message),
            Some("CLOSE") => self.close(message),
            _ => {
                tracing::debug!(cassette = %self.id, "unsupported message: {message}");
                NormalizedMessage::notice(UNSUPPORTED_MESSAGE)
            }
        }
    }
}

/// Write `input`, call `export` with it, and read the text it returns.
///
/// Both regions are released whatever happens, and an address is never
/// freed twice; every failure comes back as the notice to hand to the client.
fn call_text(
    store: &mut Store<HostState>,
    codec: &StringCodec,
    export: &TextExport,
    input: &str,
    what: &str,
) -> Result<String, NormalizedMessage> {
    let id = store.data().cassette_id().to_string();
    tracing::debug!(cassette = %id, export = %export.name(), "calling with {} bytes", input.len());

    let request = match codec.write(store, input) {
        Ok(region) => region,
        Err(CassetteError::AllocationFailed(detail)) => {
            tracing::error!(cassette = %id, "failed to allocate memory for {what}: {detail}");
            return Err(NormalizedMessage::notice(format!(
                "Error: Failed to allocate memory for {what}"
            )));
        }
        Err(e) => {
            tracing::error!(cassette = %id, "failed to write {what}: {e}");
            return Err(NormalizedMessage::notice(e.notice_text()));
        }
    };

    let mut args = vec![request.ptr()];
    if export.takes_len() {
        args.push(request.content_len());
    }

    let string = match export.call(store, &args) {
        Ok(Some(string)) => string,
        Ok(None) => {
            tracing::warn!(cassette = %id, export = %export.name(), "returned a null pointer");
            codec.release(store, request);
            return Err(NormalizedMessage::notice(EMPTY_RESPONSE));
        }
        Err(e) => {
            tracing::error!(cassette = %id, export = %export.name(), "call failed: {e}");
            codec.release(store, request);
            return Err(NormalizedMessage::notice(e.notice_text()));
        }
    };

    // An answer written in place shares the request's address; only the
    // request token may free it.
    let in_place = string.ptr() == request.ptr();
    let read = codec.read(store, string);
    codec.release(store, request);
    let (result, region) = match read {
        Ok((text, region)) => (Ok(text), region),
        Err(e) => {
            tracing::error!(cassette = %id, export = %export.name(), "failed to read result: {e}");
            (
                Err(NormalizedMessage::notice(e.notice_text())),
                GuestRegion::unread(string),
            )
        }
    };
    if in_place {
        region.forget();
    } else {
        codec.release(store, region);
    }
    result
}

/// Fetch describe or schema text with whichever transfer the cassette has.
fn fetch(
    store: &mut Store<HostState>,
    codec: &StringCodec,
    transfer: &Transfer,
) -> Result<String, CassetteError> {
    match transfer {
        Transfer::Direct(export) => {
            let string = export.call(store, &[])?.ok_or_else(|| {
                CassetteError::MarshallingFailed(format!("{} returned a null pointer", export.name()))
            })?;
            match codec.read(store, string) {
                Ok((text, region)) => {
                    codec.release(store, region);
                    Ok(text)
                }
                Err(e) => {
                    codec.release(store, GuestRegion::unread(string));
                    Err(e)
                }
            }
        }
        Transfer::Chunked { size, chunk } => {
            let total = size.call(store, &[])?.first().copied().unwrap_or(0);
            if total > codec.max_len() as u64 {
                return Err(CassetteError::MarshallingFailed(format!(
                    "{} reported {total} bytes, over the {} byte limit",
                    size.name(),
                    codec.max_len()
                )));
            }

            // Chunks are joined as bytes and decoded once, so a multi-byte
            // character split across two chunks survives.
            let mut bytes = Vec::with_capacity(total as usize);
            let mut offset = 0;
            while offset < total {
                let string = chunk.call(store, &[offset, CHUNK_LEN])?.ok_or_else(|| {
                    CassetteError::MarshallingFailed(format!(
                        "{} returned a null pointer at offset {offset}",
                        chunk.name()
                    ))
                })?;
                let (part, region) = match codec.read_bytes(store, string) {
                    Ok(read) => read,
                    Err(e) => {
                        codec.release(store, GuestRegion::unread(string));
                        return Err(e);
                    }
                };
                codec.release(store, region);
                bytes.extend_from_slice(&part);
                offset += CHUNK_LEN;
            }

            String::from_utf8(bytes).map_err(|e| {
                CassetteError::MarshallingFailed(format!(
                    "{} produced invalid UTF-8: {e}",
                    chunk.name()
                ))
            })
        }
    }
}
