use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Load a config file (any format the `config` crate understands), with
/// `STAGERT__`-prefixed environment variables layered on top, e.g.
/// `STAGERT__DEFAULTS__MAX_THREADS=8`.
pub fn load_cfg<T: for<'a> Deserialize<'a>>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let cfg = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("STAGERT").separator("__"))
        .build()
        .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

    cfg.try_deserialize()
        .with_context(|| format!("failed to deserialize runtime config from {}", path.display()))
}
