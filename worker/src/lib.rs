pub mod aggregate;
pub mod decompose;
pub mod service;

pub use aggregate::{aggregate_many, aggregate_pair};
pub use decompose::{decompose, direct_fold, Decomposition, IDENTITY};
pub use service::{ServiceContainer, TaskContext};
