//! LoRaWAN join server.
//!
//! Admits end-devices onto the network: authenticates Join-Requests,
//! derives session key material for both the 1.0.x and 1.1 key
//! hierarchies, answers with an encrypted Join-Accept, and hands derived
//! keys to the serving operators as KEK-wrapped envelopes over the
//! Backend Interfaces JSON exchange.

pub mod backend;
pub mod config;
pub mod joinserver;
pub mod lorawan;
pub mod server;
pub mod store;
