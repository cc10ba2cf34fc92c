use serde::Deserialize;

/// Top-level configuration for every adapter process.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub log_level: String,
    /// Process identity reported by `/health`. Generated when blank.
    pub instance_id: String,
    /// Accepted for compatibility; tracing export is not wired.
    pub jaeger_url: Option<String>,
    pub http: HttpSettings,
    pub ws: WsSettings,
    pub coap: CoapSettings,
    pub mqtt: MqttSettings,
    pub broker: BrokerSettings,
    pub auth: AuthSettings,
    pub session: SessionSettings,
    pub shutdown: ShutdownSettings,
    pub events: EventSettings,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WsSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CoapSettings {
    pub host: String,
    pub port: u16,
    /// Port of the companion HTTP listener serving `/health` and `/metrics`.
    pub http_port: u16,
    /// Idle time before an observer is asked to confirm it is still there.
    pub keepalive_secs: u64,
    /// Initial wait for an ACK; doubles on every retransmission.
    pub ack_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Upstream MQTT broker the proxy forwards to.
    pub target_host: String,
    pub target_port: u16,
    pub http_port: u16,
    pub max_packet_bytes: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub url: String,
    /// Envelopes held while the broker is unreachable. Zero disables spilling.
    pub spill_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AuthSettings {
    pub url: String,
    pub timeout_ms: u64,
    pub client_tls: bool,
    pub ca_certs: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SessionSettings {
    pub egress_queue_depth: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ShutdownSettings {
    pub drain_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EventSettings {
    pub path: String,
    pub max_len: usize,
}

/// Configuration as read from files and environment, every field optional.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub log_level: Option<String>,
    pub instance_id: Option<String>,
    pub jaeger_url: Option<String>,
    pub http: Option<PartialHttpSettings>,
    pub ws: Option<PartialWsSettings>,
    pub coap: Option<PartialCoapSettings>,
    pub mqtt: Option<PartialMqttSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub auth: Option<PartialAuthSettings>,
    pub session: Option<PartialSessionSettings>,
    pub shutdown: Option<PartialShutdownSettings>,
    pub events: Option<PartialEventSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialHttpSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_body_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialWsSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialCoapSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub http_port: Option<u16>,
    pub keepalive_secs: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialMqttSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub http_port: Option<u16>,
    pub max_packet_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub url: Option<String>,
    pub spill_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialAuthSettings {
    pub url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub client_tls: Option<bool>,
    pub ca_certs: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSessionSettings {
    pub egress_queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialShutdownSettings {
    pub drain_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialEventSettings {
    pub path: Option<String>,
    pub max_len: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            instance_id: String::new(),
            jaeger_url: None,
            http: HttpSettings {
                host: "0.0.0.0".to_string(),
                port: 8008,
                max_body_bytes: 1024 * 1024,
            },
            ws: WsSettings {
                host: "0.0.0.0".to_string(),
                port: 8186,
            },
            coap: CoapSettings {
                host: "0.0.0.0".to_string(),
                port: 5683,
                http_port: 5684,
                keepalive_secs: 30,
                ack_timeout_ms: 2000,
            },
            mqtt: MqttSettings {
                host: "0.0.0.0".to_string(),
                port: 1883,
                target_host: "localhost".to_string(),
                target_port: 1884,
                http_port: 8889,
                max_packet_bytes: 256 * 1024,
            },
            broker: BrokerSettings {
                url: "memory://".to_string(),
                spill_capacity: 0,
            },
            auth: AuthSettings {
                url: "http://localhost:7000".to_string(),
                timeout_ms: 1000,
                client_tls: false,
                ca_certs: None,
            },
            session: SessionSettings {
                egress_queue_depth: 64,
            },
            shutdown: ShutdownSettings { drain_secs: 30 },
            events: EventSettings {
                path: "iotbridge-events".to_string(),
                max_len: 1000,
            },
        }
    }
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let http = self.http.unwrap_or_default();
        let ws = self.ws.unwrap_or_default();
        let coap = self.coap.unwrap_or_default();
        let mqtt = self.mqtt.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let auth = self.auth.unwrap_or_default();

        Settings {
            log_level: self.log_level.unwrap_or(default.log_level),
            instance_id: self.instance_id.unwrap_or(default.instance_id),
            jaeger_url: self.jaeger_url.filter(|u| !u.is_empty()).or(default.jaeger_url),
            http: HttpSettings {
                host: http.host.unwrap_or(default.http.host),
                port: http.port.unwrap_or(default.http.port),
                max_body_bytes: http.max_body_bytes.unwrap_or(default.http.max_body_bytes),
            },
            ws: WsSettings {
                host: ws.host.unwrap_or(default.ws.host),
                port: ws.port.unwrap_or(default.ws.port),
            },
            coap: CoapSettings {
                host: coap.host.unwrap_or(default.coap.host),
                port: coap.port.unwrap_or(default.coap.port),
                http_port: coap.http_port.unwrap_or(default.coap.http_port),
                keepalive_secs: coap.keepalive_secs.unwrap_or(default.coap.keepalive_secs),
                ack_timeout_ms: coap.ack_timeout_ms.unwrap_or(default.coap.ack_timeout_ms),
            },
            mqtt: MqttSettings {
                host: mqtt.host.unwrap_or(default.mqtt.host),
                port: mqtt.port.unwrap_or(default.mqtt.port),
                target_host: mqtt.target_host.unwrap_or(default.mqtt.target_host),
                target_port: mqtt.target_port.unwrap_or(default.mqtt.target_port),
                http_port: mqtt.http_port.unwrap_or(default.mqtt.http_port),
                max_packet_bytes: mqtt
                    .max_packet_bytes
                    .unwrap_or(default.mqtt.max_packet_bytes),
            },
            broker: BrokerSettings {
                url: broker.url.unwrap_or(default.broker.url),
                spill_capacity: broker
                    .spill_capacity
                    .unwrap_or(default.broker.spill_capacity),
            },
            auth: AuthSettings {
                url: auth.url.unwrap_or(default.auth.url),
                timeout_ms: auth.timeout_ms.unwrap_or(default.auth.timeout_ms),
                client_tls: auth.client_tls.unwrap_or(default.auth.client_tls),
                ca_certs: auth.ca_certs.filter(|c| !c.is_empty()).or(default.auth.ca_certs),
            },
            session: SessionSettings {
                egress_queue_depth: self
                    .session
                    .and_then(|s| s.egress_queue_depth)
                    .unwrap_or(default.session.egress_queue_depth),
            },
            shutdown: ShutdownSettings {
                drain_secs: self
                    .shutdown
                    .and_then(|s| s.drain_secs)
                    .unwrap_or(default.shutdown.drain_secs),
            },
            events: {
                let events = self.events.unwrap_or_default();
                EventSettings {
                    path: events.path.unwrap_or(default.events.path),
                    max_len: events.max_len.unwrap_or(default.events.max_len),
                }
            },
        }
    }
}
