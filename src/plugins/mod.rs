//! Plugin system for Awsible.
//!
//! Plugins extend the template side of playbook processing. The only category
//! currently shipped is filter plugins: Jinja2-compatible functions for
//! reshaping pre-fetched AWS API responses inside templates.
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use awsible::plugins::filter::FilterRegistry;
//! use minijinja::Environment;
//!
//! let mut env = Environment::new();
//! FilterRegistry::register_all(&mut env);
//! ```

pub mod filter;
