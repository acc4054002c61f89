//! Cassette loading: source → validated binary → instance → probed handle.

use std::sync::atomic::{AtomicU64, Ordering};

use wasmtime::{Engine, Module, Store};

use crate::capabilities::probe;
use crate::cassette::{Cassette, Metadata};
use crate::config::LoaderConfig;
use crate::error::CassetteError;
use crate::imports::{base_environment, resolve_missing, HostState};
use crate::source::{file_stem, read_source, validate_wasm, CassetteSource};

/// Process-wide suffix that keeps cassette ids unique.
static NEXT_CASSETTE_ID: AtomicU64 = AtomicU64::new(1);

/// `<file stem>-<n>`, unique within the process.
pub fn next_cassette_id(file_name: &str) -> String {
    let n = NEXT_CASSETTE_ID.fetch_add(1, Ordering::Relaxed);
    format!("{}-{n}", file_stem(file_name))
}

/// Compiles and instantiates cassettes against one engine.
#[derive(Clone)]
pub struct CassetteLoader {
    engine: Engine,
    config: LoaderConfig,
}

impl std::fmt::Debug for CassetteLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CassetteLoader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for CassetteLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

impl CassetteLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            engine: Engine::default(),
            config,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load a cassette from any source.
    ///
    /// Reading and compiling are the only steps that suspend; instantiation,
    /// probing, and the metadata `describe` call run synchronously.
    pub async fn load(&self, source: &CassetteSource) -> Result<Cassette, CassetteError> {
        let file_name = source.file_name();
        let id = next_cassette_id(&file_name);
        tracing::info!(cassette = %id, file = %file_name, "loading cassette");

        let result = self.load_inner(&id, file_name, source).await;
        match &result {
            Ok(cassette) => tracing::info!(
                cassette = %id,
                name = %cassette.name(),
                version = %cassette.version(),
                stubbed = cassette.stubbed_imports().len(),
                "cassette loaded"
            ),
            Err(e) => tracing::error!(cassette = %id, "failed to load cassette: {e}"),
        }
        result
    }

    async fn load_inner(
        &self,
        id: &str,
        file_name: String,
        source: &CassetteSource,
    ) -> Result<Cassette, CassetteError> {
        let bytes = read_source(source, &self.config).await?;
        let imports = validate_wasm(&bytes)?;
        tracing::debug!(cassette = %id, imports = imports.len(), "validated binary");

        let engine = self.engine.clone();
        let module = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
            .await
            .map_err(|e| CassetteError::CompileFailed(format!("compile task failed: {e}")))?
            .map_err(|e| CassetteError::CompileFailed(format!("{e:#}")))?;

        self.instantiate(id, file_name, &module)
    }

    /// Link, instantiate, probe, and describe an already compiled module.
    pub fn instantiate(
        &self,
        id: &str,
        file_name: String,
        module: &Module,
    ) -> Result<Cassette, CassetteError> {
        let mut store = Store::new(&self.engine, HostState::new(id));

        let mut env = base_environment(&self.engine, &mut store, module, &self.config)?;
        let stubbed = resolve_missing(&mut env, &mut store, module, &self.config)?;
        for import in &stubbed {
            tracing::debug!(
                cassette = %id,
                import = %format!("{}.{}", import.module, import.name),
                sink = ?import.sink,
                "using stub"
            );
        }

        let instance = env.instantiate(&mut store, module)?;
        let dispatch = probe(&mut store, &instance)?;

        let mut cassette = Cassette::new(
            file_name,
            store,
            instance,
            dispatch,
            stubbed,
            self.config.max_string_len,
            self.config.deduplicate_events,
        );
        let describe = cassette.describe();
        let metadata = Metadata::from_describe(describe, cassette.file_name());
        cassette.set_metadata(metadata);

        Ok(cassette)
    }
}

/// Load with a one-off loader.
pub async fn load_cassette(
    source: &CassetteSource,
    config: LoaderConfig,
) -> Result<Cassette, CassetteError> {
    CassetteLoader::new(config).load(source).await
}
