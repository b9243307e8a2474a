//! RoomWatch coordination core: broker session, topic routing, cooling and
//! alarm policy, sealed payloads, operator surface.

pub mod broker;
pub mod config;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod events;
pub mod health;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod policy;
pub mod producer;
pub mod router;
pub mod state;
pub mod window;
