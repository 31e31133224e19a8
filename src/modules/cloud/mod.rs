//! Cloud provider modules.
//!
//! All modules in this tree run on the control node and talk to a remote
//! control plane over its API; nothing executes on managed hosts.

pub mod aws;
