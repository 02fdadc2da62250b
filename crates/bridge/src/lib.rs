//! The Switchboard bridge: accepts one wire-protocol run request and
//! streams back a protocol-correct event sequence produced by an injected
//! agent runtime.
//!
//! The moving parts: [`orchestrator::Bridge`] dispatches requests and
//! manages background executions, [`translator::EventTranslator`] converts
//! runtime events to wire events under strict ordering rules, and
//! [`proxy::ClientProxyToolset`] exposes client-declared tools to the
//! runtime as long-running stubs.

pub mod convert;
pub mod execution;
pub mod identity;
pub mod orchestrator;
pub mod proxy;
pub mod translator;

pub use execution::ExecutionState;
pub use identity::IdentityResolver;
pub use orchestrator::{Bridge, BridgeBuilder};
pub use proxy::ClientProxyToolset;
pub use translator::EventTranslator;
