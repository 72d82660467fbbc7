use anyhow::bail;
use tracing::info;

use crate::app::App;

pub fn config(app: &App, key: &str, value: Option<String>) -> anyhow::Result<()> {
    let Some(raw) = value else {
        match app.cfg.get::<toml::Value>(key) {
            Some(value) => info!("{key} = {value}"),
            None => bail!("no configuration value at '{key}'"),
        }
        return Ok(());
    };

    let value = parse_value(&raw);
    if !app.cfg.set(key, value.clone()) {
        bail!("'{key}' could not be persisted");
    }
    info!("{key} = {value}");
    Ok(())
}

/// Booleans and numbers are stored typed, everything else as a string.
fn parse_value(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        toml::Value::Boolean(b)
    } else if let Ok(i) = raw.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_keep_their_type() {
        assert_eq!(parse_value("true"), toml::Value::Boolean(true));
        assert_eq!(parse_value("120"), toml::Value::Integer(120));
        assert_eq!(parse_value("wlan0"), toml::Value::String("wlan0".into()));
    }
}
