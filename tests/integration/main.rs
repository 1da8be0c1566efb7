// End-to-end scenarios against the in-memory broker.

mod common;
mod connection_test;
mod rpc_test;
