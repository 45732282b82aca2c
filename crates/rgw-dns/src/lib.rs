//! The DNS Frontend (C4, §4.4): wire handling over UDP and TCP, the
//! interface×SOA-membership dispatch matrix, WAN-in-SOA resolution, carrier-grade
//! sub-resolution, LAN-no-SOA forwarding with query coalescing, and DDNS-driven
//! host lifecycle via UPDATE messages.

pub mod coalesce;
pub mod frontend;
pub mod resolver;

pub use frontend::{DnsFrontend, Iface};
