pub mod error;
pub mod k8s;
