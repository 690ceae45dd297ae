use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

/// Open a Zenoh session.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    tracing::debug!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Opening Zenoh session"
    );

    let session = zenoh::open(to_zenoh_config(config)?).await?;
    tracing::info!(zid = %session.zid(), mode = %config.mode, "Zenoh session open");

    Ok(session)
}

/// Native Zenoh configuration for our config section.
pub fn to_zenoh_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    let mut native = zenoh::Config::default();

    set(&mut native, "mode", &format!("\"{}\"", config.mode))?;
    if !config.connect.is_empty() {
        set(&mut native, "connect/endpoints", &serde_json::to_string(&config.connect)?)?;
    }
    if !config.listen.is_empty() {
        set(&mut native, "listen/endpoints", &serde_json::to_string(&config.listen)?)?;
    }

    Ok(native)
}

fn set(native: &mut zenoh::Config, key: &str, value: &str) -> Result<()> {
    native
        .insert_json5(key, value)
        .map_err(|e| Error::Config(format!("Invalid zenoh {} '{}': {}", key, value, e)))
}
