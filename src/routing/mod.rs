//! Routing module for Tetherd
//!
//! Decides, per accepted connection or inbound stream, whether traffic
//! terminates here or continues through a tether.

mod table;

pub use table::{Destination, RoutingTable, LOCAL, WILDCARD};
