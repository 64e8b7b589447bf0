//! DCops CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for DCops controllers.

pub mod maas_machine;

pub use maas_machine::*;
