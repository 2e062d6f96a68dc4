//! Process-wide registries for test suites.
//!
//! `models()` and `fixtures()` are lazy singletons. The first caller loads
//! everything from the locations in [`Config`]; concurrent first callers wait
//! on the same initialisation and later callers get the cached registry. A
//! failed initialisation is not cached.

use std::sync::Arc;

use docfix_domain::config::{Config, LogFormat};
use docfix_domain::fixtures::FixtureRegistry;
use docfix_domain::models::SchemaRegistry;
use docfix_domain::pool::PoolSet;
use docfix_domain::{CoreError, DescriptorProvider};
use fs_loader::{FixtureFiles, ModelFiles};
use tokio::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static MODELS: OnceCell<Arc<SchemaRegistry>> = OnceCell::const_new();
static FIXTURES: OnceCell<Arc<FixtureRegistry>> = OnceCell::const_new();

/// The shared schema registry, built from `*.model.json` files under the
/// configured models root on the global pool set.
pub async fn models() -> Result<Arc<SchemaRegistry>, CoreError> {
    MODELS
        .get_or_try_init(|| async {
            let config = Config::from_env()?;
            config.warn_if_unconfigured();
            let registry = build_models(&config, PoolSet::global()).await?;
            Ok::<_, CoreError>(Arc::new(registry))
        })
        .await
        .cloned()
}

/// The shared fixture registry. Fixture files are read before the schema
/// registry is awaited.
pub async fn fixtures() -> Result<Arc<FixtureRegistry>, CoreError> {
    FIXTURES
        .get_or_try_init(|| async {
            let config = Config::from_env()?;
            let sources = FixtureFiles::new(&config.fixtures_dir).descriptors()?;
            let models = models().await?;
            let registry = FixtureRegistry::from_sources(sources, models)?;
            Ok::<_, CoreError>(Arc::new(registry))
        })
        .await
        .cloned()
}

/// Build a schema registry for `config` without touching the singletons.
pub async fn build_models(config: &Config, pools: Arc<PoolSet>) -> Result<SchemaRegistry, CoreError> {
    install_drivers(config)?;
    info!(root = %config.models_root.display(), "loading models");
    SchemaRegistry::load(&ModelFiles::new(&config.models_root), pools).await
}

/// Build a fixture registry for `config` on top of `models`.
pub fn build_fixtures(
    config: &Config,
    models: Arc<SchemaRegistry>,
) -> Result<FixtureRegistry, CoreError> {
    info!(dir = %config.fixtures_dir.display(), "loading fixtures");
    FixtureRegistry::load(&FixtureFiles::new(&config.fixtures_dir), models)
}

#[cfg(feature = "sqlite")]
fn install_drivers(config: &Config) -> Result<(), CoreError> {
    match &config.sqlite_root {
        Some(root) => sqlite_adapter::install(root.clone()),
        None => Ok(()),
    }
}

#[cfg(not(feature = "sqlite"))]
fn install_drivers(config: &Config) -> Result<(), CoreError> {
    if config.sqlite_root.is_some() {
        tracing::warn!("sqlite root configured but the sqlite feature is disabled");
    }
    Ok(())
}

/// Install a global subscriber. Later calls leave the first one in place.
pub fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(fmt::time::SystemTime)
                    .with_test_writer(),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(true).with_test_writer())
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
