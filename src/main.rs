use std::env;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strata::error::Result;
use strata::model::CiModel;
use strata::persist::{Persistor, TemporalStore};
use strata::settings::Settings;
use strata::traits::{core_traits, traits_from_json, TraitCatalog};

fn init_tracing(settings: &Settings) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // an optional config file path is the only argument
    let config_file = env::args().nth(1);
    let settings = Settings::load(config_file.as_deref())?;
    init_tracing(&settings);
    info!(
        service_version = env!("CARGO_PKG_VERSION"),
        database = settings.database.path.as_deref().unwrap_or(":memory:"),
        user = %settings.user,
        "starting strata"
    );

    let store: Arc<dyn TemporalStore> = Arc::new(Persistor::new(settings.persistence_mode())?);

    let mut sources = core_traits()?;
    if let Some(path) = &settings.trait_catalog {
        let json = std::fs::read_to_string(path).map_err(|e| {
            strata::error::StrataError::Config(format!("cannot read trait catalog {path}: {e}"))
        })?;
        let data_traits = traits_from_json(&json)?;
        info!(path = %path, traits = data_traits.len(), "loaded trait catalog");
        sources.extend(data_traits);
    }
    let (catalog, dropped) = TraitCatalog::build(sources);
    for (id, issue) in &dropped {
        warn!(trait_id = %id, issue = %issue, "trait unavailable");
    }
    info!(traits = catalog.len(), dropped = dropped.len(), "trait catalog ready");

    let cis = CiModel::new(store).ci_ids().await?;
    info!(cis = cis.len(), "store opened");
    Ok(())
}
