//! REST storage core for the cluster Service object: policy gating,
//! transactional cluster-IP and node-port allocation, and backend redirect
//! resolution. The object store, endpoints store and pod reader are
//! external collaborators behind the traits in [`storage`].

pub mod error;
pub mod rest;
pub mod service;
pub mod storage;
pub mod strategy;
pub mod validation;

pub use error::{Error, FieldError, Result};
pub use rest::{Rest, ServiceAllocators};
