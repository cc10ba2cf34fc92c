mod settings;

use std::env;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};

use crate::utils::logging;
use settings::PartialSettings;

pub use settings::{
    AuthSettings, BrokerSettings, CoapSettings, EventSettings, HttpSettings, MqttSettings,
    SessionSettings, Settings, ShutdownSettings, WsSettings,
};

/// Flat environment variables and the keys they override.
const FLAT_OVERRIDES: [(&str, &str); 14] = [
    ("HTTP_HOST", "http.host"),
    ("HTTP_PORT", "http.port"),
    ("WS_HOST", "ws.host"),
    ("WS_PORT", "ws.port"),
    ("COAP_HOST", "coap.host"),
    ("COAP_PORT", "coap.port"),
    ("MQTT_HOST", "mqtt.host"),
    ("MQTT_PORT", "mqtt.port"),
    ("BROKER_URL", "broker.url"),
    ("CLIENT_TLS", "auth.client_tls"),
    ("CA_CERTS", "auth.ca_certs"),
    ("JAEGER_URL", "jaeger_url"),
    ("INSTANCE_ID", "instance_id"),
    ("LOG_LEVEL", "log_level"),
];

const SUPPORTED_BROKER_SCHEMES: [&str; 1] = ["memory://"];

/// Loads the configuration from `config/default`, nested `SECTION__KEY`
/// environment variables and the flat variables every adapter recognizes,
/// then fills the gaps from `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("__"));

    let config = apply_flat_overrides(builder)?.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    let mut settings = partial.merge(Settings::default());
    if settings.instance_id.trim().is_empty() {
        settings.instance_id = uuid::Uuid::new_v4().to_string();
    }
    validate(&settings)?;
    Ok(settings)
}

fn apply_flat_overrides(
    mut builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    for (var, key) in FLAT_OVERRIDES {
        builder = builder.set_override_option(key, env::var(var).ok())?;
    }

    let auth_url = env::var("THINGS_AUTH_GRPC_URL")
        .or_else(|_| env::var("AUTH_GRPC_URL"))
        .ok();
    builder = builder.set_override_option("auth.url", auth_url)?;

    if let Ok(raw) = env::var("THINGS_AUTH_GRPC_TIMEOUT") {
        let timeout = parse_duration(&raw)?;
        let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        builder = builder.set_override("auth.timeout_ms", millis)?;
    }
    Ok(builder)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    logging::parse_level(&settings.log_level).map_err(|e| ConfigError::Message(e.to_string()))?;

    if !SUPPORTED_BROKER_SCHEMES
        .iter()
        .any(|scheme| settings.broker.url.starts_with(scheme))
    {
        return Err(ConfigError::Message(format!(
            "unsupported broker url {:?}",
            settings.broker.url
        )));
    }
    if settings.session.egress_queue_depth == 0 {
        return Err(ConfigError::Message(
            "session.egress_queue_depth must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Parse durations such as `500ms`, `1s`, `2m` or `1h`. A bare number is
/// taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::Message(format!("invalid duration {raw:?}")))?;

    let secs = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::Message(format!("duration {raw:?} out of range")))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => secs(1),
        "m" => secs(60),
        "h" => secs(3600),
        _ => Err(ConfigError::Message(format!("invalid duration {raw:?}"))),
    }
}

#[cfg(test)]
mod tests;
