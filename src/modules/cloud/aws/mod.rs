//! AWS (Amazon Web Services) modules.
//!
//! ## Available Modules
//!
//! - [`VpcPeeringModule`](peering::VpcPeeringModule): VPC peering connection
//!   lifecycle management (create, accept, reject, delete, list)
//! - [`AcmFactsModule`](acm::AcmFactsModule): ACM certificate facts
//!
//! ## Authentication
//!
//! AWS credentials are loaded from the standard AWS credential chain:
//!
//! 1. Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//! 2. AWS credentials file (`~/.aws/credentials`)
//! 3. IAM instance profile (when running on EC2)
//! 4. ECS task role (when running in ECS)
//!
//! The region can be specified via the module parameter (`region`), the
//! `AWS_REGION`/`AWS_DEFAULT_REGION` environment variables, or the AWS config
//! file (`~/.aws/config`).

pub mod acm;
pub mod peering;

pub use acm::AcmFactsModule;
pub use peering::VpcPeeringModule;
