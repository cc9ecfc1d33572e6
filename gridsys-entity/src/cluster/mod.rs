//! Cluster membership seam.
//!
//! The runtime does not manage membership itself: a [`ClusterConfig`]
//! implementation supplies the node set per kind and a stream of topology
//! events. [`StaticClusterConfig`] covers single-node deployments and
//! in-process multi-node tests.

mod config;

pub use config::{ClusterConfig, ClusterEvent, StaticClusterConfig};
