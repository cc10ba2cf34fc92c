//! # iotbridge
//!
//! `iotbridge` is a multi-protocol ingress layer for IoT devices. Devices
//! publish over HTTP, WebSocket, MQTT or CoAP; every adapter checks the
//! device key with the things service and turns the request into one
//! canonical envelope on a shared message broker, from which the
//! subscribing adapters fan it back out.
//!
//! ## Core Modules
//!
//! - `messaging`: the envelope, the topic codec and the broker abstraction with its in-process engine.
//! - `auth`: device authorization against the things service.
//! - `adapter`: the ingress logic every protocol shares (authorize, publish, subscribe).
//! - `client`: subscriber records and their bounded egress queues.
//! - `http`, `ws`, `mqtt`, `coap`: the protocol adapters.
//! - `events`: the presence stream the MQTT adapter feeds.
//! - `routemap`: persistent internal/external id mapping.
//! - `server`: graceful shutdown and drain.
//! - `config`: layered configuration.
//! - `utils`: error taxonomy, logging and metrics.

pub mod adapter;
pub mod auth;
pub mod client;
pub mod coap;
pub mod config;
pub mod events;
pub mod http;
pub mod messaging;
pub mod mqtt;
pub mod routemap;
pub mod server;
pub mod utils;
pub mod ws;
