//! Routing of inbound interactions to the feature that owns the current flow.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::error::{FlowError, SessionError};
use super::state::{FlowState, Namespace};
use super::store::SessionStore;
use crate::ledger::{AccountId, AccountStore};

/// An inbound interaction from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowInput {
    /// Free text typed by the user.
    Text(String),
    /// A button press carrying callback data.
    Action(String),
    /// An uploaded file, referenced by the transport's file id.
    Media {
        /// Transport file reference.
        file_ref: String,
    },
}

/// What the owning handler wants done with the account's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Keep the current state.
    Stay,
    /// Move to another state, possibly in another namespace.
    Advance(FlowState),
    /// The flow is over; return to the home context.
    Finish,
}

/// A feature module that owns one namespace of flow states.
#[async_trait]
pub trait FlowHandler: Send + Sync {
    /// The namespace this handler owns.
    fn namespace(&self) -> Namespace;

    /// Handles `input` for an account whose current state is `state`.
    ///
    /// Only called with states in [`Self::namespace`].
    ///
    /// # Errors
    ///
    /// Any error ends the flow: the dispatcher clears the account's state.
    async fn handle(
        &self,
        account: AccountId,
        state: &FlowState,
        input: &FlowInput,
    ) -> Result<Transition, FlowError>;
}

/// Routes the current flow state to its owning [`FlowHandler`].
#[derive(Clone)]
pub struct FlowDispatcher {
    sessions: SessionStore,
    accounts: AccountStore,
    handlers: HashMap<Namespace, Arc<dyn FlowHandler>>,
}

impl fmt::Debug for FlowDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDispatcher")
            .field("namespaces", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl FlowDispatcher {
    /// Creates a dispatcher with no handlers.
    #[must_use]
    pub fn new(sessions: SessionStore, accounts: AccountStore) -> Self {
        Self {
            sessions,
            accounts,
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for its namespace, replacing any previous owner.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn FlowHandler>) -> Self {
        self.handlers.insert(handler.namespace(), handler);
        self
    }

    /// Returns the session store.
    #[must_use]
    pub const fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Hands `input` to the owner of the account's current flow.
    ///
    /// Returns `Ok(None)` when the account is idle or no handler owns the
    /// namespace; the caller then treats the input in the home context.
    /// Otherwise the handler's transition is applied before returning, so
    /// the caller observes the new state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Banned`] for a banned account and
    /// [`SessionError::Handler`] when the handler fails (in both cases the
    /// state has already been cleared). A transition whose target state
    /// cannot be stored also clears the state before its error is returned.
    pub async fn dispatch(
        &self,
        account: AccountId,
        input: &FlowInput,
    ) -> Result<Option<Transition>, SessionError> {
        if matches!(self.accounts.get(account)?, Some(a) if a.banned) {
            debug!(account_id = %account, "ignoring input from banned account");
            self.sessions.clear_state(account)?;
            return Err(SessionError::Banned { account });
        }

        let state = self.sessions.get_state(account)?;
        let Some(namespace) = state.namespace() else {
            return Ok(None);
        };
        let Some(handler) = self.handlers.get(&namespace) else {
            debug!(account_id = %account, %namespace, "no handler owns flow");
            return Ok(None);
        };

        match handler.handle(account, &state, input).await {
            Ok(transition) => {
                match &transition {
                    Transition::Stay => {},
                    Transition::Advance(next) => {
                        if let Err(e) = self.sessions.set_state(account, next) {
                            warn!(account_id = %account, %namespace, error = %e, "transition not stored, clearing state");
                            self.sessions.clear_state(account)?;
                            return Err(e);
                        }
                    },
                    Transition::Finish => self.sessions.clear_state(account)?,
                }
                Ok(Some(transition))
            },
            Err(source) => {
                warn!(account_id = %account, %namespace, error = %source, "flow failed, clearing state");
                self.sessions.clear_state(account)?;
                Err(SessionError::Handler { namespace, source })
            },
        }
    }
}
