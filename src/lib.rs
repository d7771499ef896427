//! Lazy, memoized, scoped dependency resolution with a reactive stream layer.
//!
//! Executors describe deferred work; a [`Scope`] resolves them on demand,
//! resolving every node at most once, and tears everything down on
//! [`Scope::dispose`].

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod executor; // Executor descriptors, combinators, families
pub mod rx; // Push/pull observables and operators
pub mod scope; // Resolution, memoization, instrumentation

// Re-exports for convenience
pub use core::config::ScopeConfig;
pub use core::errors::{Result, ScopeError};
pub use executor::{
    combine, create_family, defaults, derive, derive_async, factorize, factory, group, map,
    map_with, provide, provide_async, provide_optional, registry, value, AnyExecutor, AnyValue,
    Arity, AsExecutor, AsyncFactory, Combined, DependencyGraph, Executor, ExecutorBuilder,
    ExecutorId, ExecutorInfo, ExecutorKind, Factory, Family, FamilyOptions, ProviderCtx, Slot,
};
pub use rx::{
    combine_latest, create_pipe, derive_observable, provide_observable, pull_observable,
    push_observable, Holder, Observable, Observer, Publisher, Subject,
};
pub use scope::{
    clear_instruments, create_scope, default_scope, set_instrument, HookInstrument, Instrument,
    Pipeline, Scope, Services,
};
