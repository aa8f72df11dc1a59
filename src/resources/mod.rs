pub mod common;
pub mod configmap;
pub mod pdb;
pub mod service;
pub mod statefulset;

pub use common::{
    API_VERSION, FIELD_MANAGER, KIND, bookie_labels, cluster_labels, owner_reference,
};
