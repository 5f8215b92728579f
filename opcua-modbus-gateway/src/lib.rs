//! Bidirectional gateway between Modbus TCP and OPC UA.
//!
//! A declarative node tree maps holding registers (whole words, bytes or
//! single bits) onto typed OPC UA variables. A polling engine keeps both
//! sides in sync: device changes are published to OPC UA, and client writes
//! to writable variables are written back to the device.
//!
//! # Layout
//!
//! - [`config`] - JSON5 configuration and validation
//! - [`builder`] - Builds the address space and tag registry from the node tree
//! - [`engine`] - The synchronization loop
//! - [`codec`] - Register word to tag value conversion
//! - [`modbus`] / [`opcua_server`] - The two protocol sides

pub mod address_space;
pub mod builder;
pub mod codec;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod memory;
pub mod modbus;
pub mod opcua_server;
pub mod registry;
pub mod tag;
pub mod value;
