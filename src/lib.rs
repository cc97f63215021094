//! containap: a protocol-aware proxy that fronts containerized Minecraft
//! servers, starting them on the first real login and stopping them again
//! once nobody has played for a while. Status pings are answered from
//! config without ever waking a backend.

pub mod bedrock;
pub mod config;
pub mod docker;
pub mod events;
pub mod forward;
pub mod java;
pub mod lifecycle;
pub mod mcproto;
pub mod probe;
pub mod proxy;
pub mod raknet;
