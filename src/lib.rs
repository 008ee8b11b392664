//! pontoon - a multi-user IRC bouncer.
//!
//! pontoon keeps persistent connections to remote IRC networks on behalf of
//! its users and multiplexes them to any number of attached clients. While
//! no client is attached it stays joined, records messages and replays
//! missed activity on reconnect.
//!
//! Architecture in one paragraph: each user is an actor. One task per user
//! drains a bounded event queue and is the only mutator of that user's
//! state; reconnect loops, upstream readers and client readers run as
//! separate tasks that communicate with the dispatcher purely by posting
//! events. The [`server`] module owns the registry of user actors.

pub mod backoff;
pub mod config;
pub mod db;
pub mod delivered;
pub mod downstream;
pub mod error;
pub mod ident;
pub mod network;
pub mod push;
pub mod server;
mod service;
pub mod store;
pub mod upstream;
pub mod user;
