//! Scopes and the instrumentation pipeline that wraps provider calls

pub mod instrument;
#[allow(clippy::module_inception)]
pub mod scope;

pub use instrument::{
    clear_instruments, global_pipeline, set_instrument, set_instrument_with, CallContext,
    CallTarget, HookInstrument, Instrument, PendingCall, Pipeline, Service, ServiceFn, Services,
    TracingInstrument,
};
pub use scope::{create_scope, default_scope, Resolution, Scope};
