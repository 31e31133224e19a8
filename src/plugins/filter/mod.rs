//! Jinja2-compatible filter plugins for Awsible.
//!
//! Filters reshape pre-fetched AWS `describe-*` API responses into the flat
//! values playbooks actually consume. They are pure functions over template
//! values: no I/O, no mutation, and malformed input degrades to an empty or
//! undefined result rather than an error.
//!
//! # Usage
//!
//! ```rust,ignore
//! use awsible::plugins::filter::FilterRegistry;
//! use minijinja::Environment;
//!
//! let mut env = Environment::new();
//! FilterRegistry::register_all(&mut env);
//! ```

pub mod aws;

use minijinja::Environment;

/// Registry for managing and registering filter plugins.
pub struct FilterRegistry;

impl FilterRegistry {
    /// Register all available filters with the given environment.
    pub fn register_all(env: &mut Environment<'static>) {
        aws::register_filters(env);
    }

    /// Register only the AWS response-reshaping filters.
    pub fn register_aws(env: &mut Environment<'static>) {
        aws::register_filters(env);
    }
}
