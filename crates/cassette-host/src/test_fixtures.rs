//! Guest modules used by the loader and registry tests.

use crate::source::CassetteSource;

/// Bump allocator shared by the fixtures; `frees` counts dealloc calls.
const ALLOCATOR: &str = r#"
  (global $heap (mut i32) (i32.const 16384))
  (global $frees (export "frees") (mut i32) (i32.const 0))
  (func $alloc (export "alloc") (param $len i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $p))
  (func (export "dealloc") (param i32 i32)
    (global.set $frees (i32.add (global.get $frees) (i32.const 1))))
  (func $strlen (param $p i32) (result i32)
    (local $n i32)
    (block $done
      (loop $scan
        (br_if $done (i32.eqz (i32.load8_u (i32.add (local.get $p) (local.get $n)))))
        (local.set $n (i32.add (local.get $n) (i32.const 1)))
        (br $scan)))
    (local.get $n))
"#;

/// `req` answers with a fresh copy of whatever it was sent.
const ECHO_REQ: &str = r#"
  (func (export "req") (param $p i32) (result i32)
    (local $n i32)
    (local $out i32)
    (local.set $n (i32.add (call $strlen (local.get $p)) (i32.const 1)))
    (local.set $out (call $alloc (local.get $n)))
    (memory.copy (local.get $out) (local.get $p) (local.get $n))
    (local.get $out))
"#;

fn module(body: &str) -> Vec<u8> {
    let text = format!("(module\n{body}\n)");
    wat::parse_str(&text).expect("fixture WAT must assemble")
}

pub(crate) fn source(bytes: Vec<u8>, file_name: &str) -> CassetteSource {
    CassetteSource::bytes(bytes, file_name)
}

/// Direct describe/schema, echoing req, canned close, and a few imports the
/// host does not know about.
pub(crate) fn echo() -> Vec<u8> {
    module(&format!(
        r#"
  (import "env" "log" (func $log (param i32 i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "js" "offset" (global $offset i32))
  (memory (export "memory") 2)
  {ALLOCATOR}
  {ECHO_REQ}
  (data (i32.const 16) "{{\"name\":\"Echo\",\"description\":\"Echoes requests\",\"version\":\"1.0.0\"}}\00")
  (data (i32.const 256) "{{\"type\":\"object\"}}\00")
  (data (i32.const 512) "[\"NOTICE\",\"closed\"]\00")
  (func (export "describe") (result i32)
    (call $log (i32.const 16) (i32.const 6))
    (i32.const 16))
  (func (export "get_schema") (result i32) (i32.const 256))
  (func (export "close") (param i32) (result i32) (i32.const 512))
"#
    ))
}

/// Echo without a `close` export or schema.
pub(crate) fn echo_without_close() -> Vec<u8> {
    module(&format!(
        r#"
  (memory (export "memory") 1)
  {ALLOCATOR}
  {ECHO_REQ}
  (data (i32.const 16) "{{\"metadata\":{{\"name\":\"Quiet\",\"version\":\"0.3\"}}}}\00")
  (func (export "describe") (result i32) (i32.const 16))
"#
    ))
}

/// No `req` export at all.
pub(crate) fn without_req() -> Vec<u8> {
    module(&format!(
        r#"
  (memory (export "memory") 1)
  {ALLOCATOR}
  (func (export "describe") (result i32) (i32.const 0))
"#
    ))
}

/// `req` calls `env.abort`; `close` traps; describe returns garbage.
pub(crate) fn faulty() -> Vec<u8> {
    module(&format!(
        r#"
  (import "env" "abort" (func $abort (param i32 i32 i32 i32)))
  (memory (export "memory") 1)
  {ALLOCATOR}
  (data (i32.const 16) "definitely not json\00")
  (func (export "describe") (result i32) (i32.const 16))
  (func (export "req") (param i32) (result i32)
    (call $abort (i32.const 1) (i32.const 2) (i32.const 3) (i32.const 4))
    (i32.const 0))
  (func (export "close") (param i32) (result i32) unreachable)
"#
    ))
}

/// `req` returns a null pointer, `describe` traps.
pub(crate) fn silent() -> Vec<u8> {
    module(&format!(
        r#"
  (memory (export "memory") 1)
  {ALLOCATOR}
  (func (export "describe") (result i32) unreachable)
  (func (export "req") (param i32) (result i32) (i32.const 0))
"#
    ))
}

/// No allocator export.
pub(crate) fn without_alloc() -> Vec<u8> {
    module(
        r#"
  (memory (export "memory") 1)
  (func (export "req") (param i32) (result i32) (local.get 0))
"#,
    )
}

/// Allocator that always returns null.
pub(crate) fn null_alloc() -> Vec<u8> {
    module(
        r#"
  (memory (export "memory") 1)
  (func (export "alloc") (param i32) (result i32) (i32.const 0))
  (func (export "req") (param i32) (result i32) (local.get 0))
  (func (export "close") (param i32) (result i32) (local.get 0))
"#,
    )
}

/// `req` and `close` answer in place, returning the request pointer.
///
/// `double_frees` counts dealloc calls repeating the previous pointer.
pub(crate) fn in_place() -> Vec<u8> {
    module(
        r#"
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 16384))
  (global $frees (export "frees") (mut i32) (i32.const 0))
  (global $last (mut i32) (i32.const 0))
  (global $double_frees (export "double_frees") (mut i32) (i32.const 0))
  (func (export "alloc") (param $len i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $p))
  (func (export "dealloc") (param $p i32) (param i32)
    (if (i32.eq (local.get $p) (global.get $last))
      (then (global.set $double_frees (i32.add (global.get $double_frees) (i32.const 1)))))
    (global.set $last (local.get $p))
    (global.set $frees (i32.add (global.get $frees) (i32.const 1))))
  (func (export "req") (param i32) (result i32) (local.get 0))
  (func (export "close") (param i32) (result i32) (local.get 0))
"#,
    )
}

/// wasm-bindgen flavour: imported memory, decorated names, `(ptr, len)`
/// strings in both directions, a legacy helper import, and a stub target.
pub(crate) fn bindgen() -> Vec<u8> {
    let event = r#"["EVENT","s",{"id":"w1","pubkey":"p","kind":1}]"#;
    let describe = r#"{"name":"Sandwich","version":"0.9.0"}"#;
    module(&format!(
        r#"
  (import "env" "memory" (memory 1))
  (import "__wbindgen_placeholder__" "__wbindgen_string_new" (func $string_new (param i32 i32) (result i32)))
  (import "__wbindgen_placeholder__" "__wbindgen_describe" (func $wb_describe (param i32)))
  (global $frees (export "frees") (mut i32) (i32.const 0))
  (data (i32.const 256) "{event}")
  (data (i32.const 512) "{describe}")
  (func (export "__wbindgen_malloc") (param i32 i32) (result i32) (i32.const 4096))
  (func (export "__wbindgen_free") (param i32 i32 i32)
    (global.set $frees (i32.add (global.get $frees) (i32.const 1))))
  (func (export "sandwich_describe") (result i32 i32)
    (i32.const 512) (i32.const {describe_len}))
  (func (export "sandwich_req") (param i32 i32) (result i32 i32)
    (drop (call $string_new (local.get 0) (local.get 1)))
    (i32.const 256) (i32.const {event_len}))
"#,
        event = escape(event.as_bytes()),
        describe = escape(describe.as_bytes()),
        event_len = event.len(),
        describe_len = describe.len(),
    ))
}

/// Description served only through the chunked exports.
///
/// Multi-byte characters straddle the 1000 and 2000 byte chunk boundaries.
pub(crate) fn chunked_description() -> String {
    let mut text = String::from(r#"{"name":"Chunky","version":"2.0.0","description":""#);
    while text.len() < 999 {
        text.push('a');
    }
    text.push('é');
    while text.len() < 1999 {
        text.push('b');
    }
    text.push('日');
    text.push('本');
    text.push_str(r#""}"#);
    text
}

pub(crate) fn chunked() -> Vec<u8> {
    let description = chunked_description();
    module(&format!(
        r#"
  (memory (export "memory") 1)
  {ALLOCATOR}
  {ECHO_REQ}
  (data (i32.const 4096) "{data}")
  (func (export "get_description_size") (result i32) (i32.const {size}))
  (func (export "get_description_chunk") (param $off i32) (param $len i32) (result i32)
    (local $n i32)
    (local $out i32)
    (local.set $n (i32.sub (i32.const {size}) (local.get $off)))
    (if (i32.lt_u (local.get $len) (local.get $n))
      (then (local.set $n (local.get $len))))
    (local.set $out (call $alloc (i32.add (local.get $n) (i32.const 1))))
    (memory.copy (local.get $out) (i32.add (i32.const 4096) (local.get $off)) (local.get $n))
    (i32.store8 (i32.add (local.get $out) (local.get $n)) (i32.const 0))
    (local.get $out))
"#,
        data = escape(description.as_bytes()),
        size = description.len(),
    ))
}

/// Escape bytes for a WAT string literal.
fn escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{b:02x}")).collect()
}
