//! LoRaHop - Reactive multi-hop routing over half-duplex radio modems
//!
//! Nodes discover routes on demand by flooding route requests, deliver
//! application payloads hop by hop with acknowledgments and retries, and
//! announce application peers and sessions across the mesh.

pub mod config;
pub mod network;
pub mod protocol;
pub mod routing;
