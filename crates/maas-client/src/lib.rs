//! MAAS REST API Client
//!
//! A Rust client library for the MAAS 2.0 REST API.
//! Provides type-safe models and the capability traits the machine
//! provisioning controller consumes.
//!
//! # Example
//!
//! ```no_run
//! use maas_client::{AllocateParams, MaasClient, MachineRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MaasClient::new(
//!     "http://maas.maas:5240/MAAS".to_string(),
//!     "consumer:token:secret",
//! )?;
//!
//! let machine = client
//!     .allocate(AllocateParams {
//!         cpu_count: Some(4),
//!         mem: Some(8192),
//!         zone: Some("z1".to_string()),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("allocated {}", machine.system_id);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Machines**: allocate, deploy, release, power
//! - **VM hosts**: list hosts and compose VMs
//! - **Networking**: interface links, static IPs, bridges, IP registry
//! - **Tags**: idempotent creation and assignment
//! - **Typed errors**: backend error text is classified once, in [`error::classify_api_error`]

pub mod client;
pub mod common;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod maas_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::MaasClient;
pub use common::HttpClient;
pub use error::{MaasError, VmHostResource};
pub use maas_trait::{
    IpAddressRegistry, MaasClientTrait, MaasConnection, MachineRegistry,
    NetworkInterfaceRegistry, TagRegistry, VmHostRegistry,
};
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::MockMaasClient;
