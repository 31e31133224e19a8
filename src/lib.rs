//! # Awsible - AWS Modules and Filters for Playbook Automation
//!
//! Awsible is a library of AWS infrastructure modules and Jinja2-compatible
//! template filters for infrastructure-as-code playbooks. Operators declare
//! desired AWS network and certificate state in YAML; these modules supply
//! derived facts or enforce convergence toward that state.
//!
//! ## Core Concepts
//!
//! - **Modules**: Units of work executing AWS control-plane operations from
//!   the control node. Looked up by name through the [`modules::ModuleRegistry`].
//! - **Filters**: Pure Jinja2-compatible functions reshaping pre-fetched
//!   `describe-*` API responses, registered into a minijinja `Environment`.
//!
//! ## Available Modules
//!
//! - `aws_vpc_peering`: reconciles VPC peering connections toward a desired
//!   state (`present`, `active`, `pending`, `absent`, `list`) with idempotent
//!   create/accept/reject/delete operations and a bounded wait loop.
//! - `aws_acm_facts`: gathers facts about ACM certificates, optionally
//!   filtered by certificate status.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use awsible::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ModuleResult<()> {
//!     let registry = ModuleRegistry::with_builtins();
//!
//!     let mut params = ModuleParams::new();
//!     params.insert("source_vpc".into(), serde_json::json!("10.0.0.0/16"));
//!     params.insert("peer_vpc".into(), serde_json::json!("vpc-01234567"));
//!     params.insert("state".into(), serde_json::json!("present"));
//!
//!     let output = registry.execute("aws_vpc_peering", &params, &ModuleContext::new())?;
//!     println!("changed: {}", output.changed);
//!     Ok(())
//! }
//! ```
//!
//! ## Authentication
//!
//! AWS credentials come from the standard credential chain (environment,
//! credentials file, instance profile, task role). Credential handling is
//! entirely the SDK's concern; this crate never touches key material.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod modules;
pub mod plugins;

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::modules::cloud::aws::{AcmFactsModule, VpcPeeringModule};
    pub use crate::modules::{
        Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleRegistry,
        ModuleResult, ModuleStatus, ParamExt,
    };
    pub use crate::plugins::filter::FilterRegistry;
}
