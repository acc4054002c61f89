//! Cassette host error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CassetteError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("compile failed: {0}")]
    CompileFailed(String),

    #[error("instantiate failed: {0}")]
    InstantiateFailed(String),

    #[error("missing required export: {0}")]
    MissingRequiredExport(String),

    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("marshalling failed: {0}")]
    MarshallingFailed(String),

    #[error("plugin runtime fault: {0}")]
    PluginRuntimeFault(String),

    #[error("cassette not found: {0}")]
    NotFound(String),
}

impl CassetteError {
    /// Text used when this error is reported to a client as a `NOTICE`.
    pub fn notice_text(&self) -> String {
        match self {
            Self::SourceUnavailable(msg)
            | Self::CompileFailed(msg)
            | Self::InstantiateFailed(msg)
            | Self::MissingRequiredExport(msg)
            | Self::AllocationFailed(msg)
            | Self::MarshallingFailed(msg)
            | Self::PluginRuntimeFault(msg)
            | Self::NotFound(msg) => format!("Error: {msg}"),
        }
    }
}

/// Trap payload raised by `abort`-style host imports.
///
/// Carried inside the `wasmtime::Error` that unwinds the guest call so the
/// call wrapper can tell a deliberate abort from an ordinary trap.
#[derive(Debug, Error)]
#[error("cassette aborted: {0}")]
pub struct GuestAbort(pub String);

/// Convert an error returned by a guest call into a runtime fault.
pub(crate) fn runtime_fault(export: &str, err: wasmtime::Error) -> CassetteError {
    if let Some(abort) = err.downcast_ref::<GuestAbort>() {
        return CassetteError::PluginRuntimeFault(abort.to_string());
    }
    CassetteError::PluginRuntimeFault(format!("{export} trapped: {err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Display messages ──────────────────────────────────────────────

    #[test]
    fn test_display_source_unavailable() {
        let err = CassetteError::SourceUnavailable("no such file".into());
        assert_eq!(err.to_string(), "source unavailable: no such file");
    }

    #[test]
    fn test_display_compile_failed() {
        let err = CassetteError::CompileFailed("bad magic".into());
        assert_eq!(err.to_string(), "compile failed: bad magic");
    }

    #[test]
    fn test_display_instantiate_failed() {
        let err = CassetteError::InstantiateFailed("memory type mismatch".into());
        assert_eq!(err.to_string(), "instantiate failed: memory type mismatch");
    }

    #[test]
    fn test_display_missing_required_export() {
        let err = CassetteError::MissingRequiredExport("req".into());
        assert_eq!(err.to_string(), "missing required export: req");
    }

    #[test]
    fn test_display_allocation_failed() {
        let err = CassetteError::AllocationFailed("alloc returned null".into());
        assert_eq!(err.to_string(), "allocation failed: alloc returned null");
    }

    #[test]
    fn test_display_marshalling_failed() {
        let err = CassetteError::MarshallingFailed("invalid utf-8".into());
        assert_eq!(err.to_string(), "marshalling failed: invalid utf-8");
    }

    #[test]
    fn test_display_runtime_fault() {
        let err = CassetteError::PluginRuntimeFault("unreachable".into());
        assert_eq!(err.to_string(), "plugin runtime fault: unreachable");
    }

    // ── Notice text ───────────────────────────────────────────────────

    #[test]
    fn test_notice_text_uses_detail_only() {
        let err = CassetteError::AllocationFailed("Failed to allocate memory for request".into());
        assert_eq!(
            err.notice_text(),
            "Error: Failed to allocate memory for request"
        );
    }

    // ── Guest aborts ──────────────────────────────────────────────────

    #[test]
    fn test_runtime_fault_recognises_abort() {
        let err = wasmtime::Error::new(GuestAbort("out of cheese".into()));
        let fault = runtime_fault("req", err);
        assert!(matches!(fault, CassetteError::PluginRuntimeFault(_)));
        assert_eq!(
            fault.to_string(),
            "plugin runtime fault: cassette aborted: out of cheese"
        );
    }

    #[test]
    fn test_runtime_fault_plain_trap() {
        let err = wasmtime::Error::msg("integer divide by zero");
        let fault = runtime_fault("req", err);
        let text = fault.to_string();
        assert!(text.contains("req trapped"));
        assert!(text.contains("integer divide by zero"));
    }

    #[test]
    fn test_debug_formatting() {
        let err = CassetteError::NotFound("echo-1".into());
        let debug = format!("{:?}", err);
        assert!(debug.contains("NotFound"));
        assert!(debug.contains("echo-1"));
    }
}
