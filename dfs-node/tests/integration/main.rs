//! Integration tests covering multi-node scenarios end-to-end.

mod helpers;

mod bootstrap;
mod replication;
mod wire;
