//! Executor descriptors, combinators and keyed families

pub mod combinators;
#[allow(clippy::module_inception)]
pub mod executor;
pub mod family;
pub mod graph;
pub mod registry;

pub use combinators::*;
pub use executor::*;
pub use family::{
    canonical_key, create_family, BoundedPool, Family, FamilyOptions, FamilyPool, KeepAll,
    KeyBuilder, PoolControl, TtlPool,
};
pub use graph::DependencyGraph;
