//! SR-IOV network device plugin.
//!
//! Discovers network PCI functions, filters them into configured resource
//! pools and serves each pool on its own unix socket.

pub mod app;
pub mod config;
pub mod device_info;
pub mod devices;
pub mod factory;
pub mod info_provider;
pub mod inventory;
pub mod link_watcher;
pub mod manager;
pub mod pool;
pub mod rdma;
pub mod selectors;
pub mod server;
