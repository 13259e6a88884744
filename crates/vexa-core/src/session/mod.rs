//! Per-account flow state.
//!
//! Each account is in at most one multi-step flow at a time ("awaiting the
//! amount to add", "awaiting a voice sample", "chatting with the assistant").
//! The flow is a typed [`FlowState`] owned by one feature [`Namespace`]; it
//! is persisted by [`SessionStore`] as a delimited token and routed to its
//! owner by [`FlowDispatcher`].
//!
//! Payloads collected mid-flow that must not be embedded in the token live
//! in a [`ScratchStore`], which forgets them after a TTL or a restart.

mod dispatch;
mod error;
mod scratch;
mod state;
mod store;

pub use dispatch::{FlowDispatcher, FlowHandler, FlowInput, Transition};
pub use error::{FlowError, ScratchError, SessionError};
pub use scratch::{CLEANUP_INTERVAL, ScratchStore};
pub use state::{
    AdminStep, AnonChatStep, CloneStep, DELIMITER, FlowState, GenerationStep, MAX_PARAM_LEN,
    Namespace, SupportStep,
};
pub use store::SessionStore;
