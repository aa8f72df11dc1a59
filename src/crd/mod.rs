mod bookkeeper_cluster;

pub use bookkeeper_cluster::*;
