//! Cassette host
//!
//! Loads untrusted WebAssembly "cassettes" with wasmtime and presents every
//! one of them through the same request/response surface, whatever export
//! names, string conventions, or import expectations the cassette was built
//! with. Answers are normalized into canonical `NOTICE` / `EVENT` / `EOSE`
//! messages, with repeated events suppressed per subscription.

pub mod capabilities;
pub mod cassette;
pub mod config;
pub mod dedup;
pub mod error;
pub mod imports;
pub mod loader;
pub mod memory;
pub mod normalize;
pub mod registry;
pub mod source;

#[cfg(test)]
mod test_fixtures;

pub use capabilities::{CallingConvention, Capabilities};
pub use cassette::{Cassette, Metadata};
pub use config::LoaderConfig;
pub use dedup::EventDeduplicator;
pub use error::CassetteError;
pub use imports::{StubSink, StubbedImport};
pub use loader::{load_cassette, CassetteLoader};
pub use normalize::NormalizedMessage;
pub use registry::CassetteRegistry;
pub use source::CassetteSource;
