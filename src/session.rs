use std::sync::Arc;

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::api::{IdToken, TokenProvider};
use crate::auth::{Flow as AuthFlow, Session as AuthSession};
use crate::storage;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not signed in")]
    SignedOut,
    #[error("token not found")]
    TokenNotFound,
}

/// The signed-in user as the rest of the client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub uid: String,
    pub display_name: String,
    pub avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(User),
    SignedOut,
}

struct Active {
    session: AuthSession,
    provider: Arc<dyn TokenProvider>,
}

pub struct Manager {
    store: Arc<storage::Store>,
    flow: Arc<AuthFlow>,
    active: RwLock<Option<Active>>,
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
}

impl Manager {
    pub fn new(store: Arc<storage::Store>, flow: Arc<AuthFlow>) -> Self {
        Self {
            store,
            flow,
            active: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Restores the most recently used account that still has a token.
    pub fn load_existing(&self) -> Result<Option<User>> {
        for account in self.store.list_accounts()? {
            let Some(token) = self.store.get_token(account.id)? else {
                continue;
            };
            let session = self.flow.resume(account, token)?;
            debug!(uid = %session.account.uid, "restored session");
            return Ok(Some(self.activate(session)));
        }
        Ok(None)
    }

    pub fn current_user(&self) -> Option<User> {
        self.active
            .read()
            .as_ref()
            .map(|active| user_of(&active.session))
    }

    /// A bearer token for the next request, refreshed when close to expiry.
    pub fn credential(&self) -> Result<IdToken> {
        let provider = self
            .active
            .read()
            .as_ref()
            .map(|active| active.provider.clone())
            .ok_or(SessionError::SignedOut)?;
        provider.token()
    }

    /// Receives every later sign-in change, starting with the current state.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        let current = match self.current_user() {
            Some(user) => SessionEvent::SignedIn(user),
            None => SessionEvent::SignedOut,
        };
        let _ = tx.send(current);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn sign_in(&self, refresh_token: &str) -> Result<User> {
        let session = self.flow.sign_in(refresh_token)?;
        Ok(self.activate(session))
    }

    /// Forgets the active account, including its stored token.
    pub fn sign_out(&self) -> Result<bool> {
        let Some(active) = self.active.write().take() else {
            return Ok(false);
        };
        self.store.delete_account(active.session.account.id)?;
        info!(uid = %active.session.account.uid, "signed out");
        self.publish(SessionEvent::SignedOut);
        Ok(true)
    }

    fn activate(&self, session: AuthSession) -> User {
        let user = user_of(&session);
        let provider = self.flow.token_provider(session.account.id);
        *self.active.write() = Some(Active { session, provider });
        self.publish(SessionEvent::SignedIn(user.clone()));
        user
    }

    fn publish(&self, event: SessionEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl TokenProvider for Manager {
    fn token(&self) -> Result<IdToken> {
        self.credential()
    }
}

fn user_of(session: &AuthSession) -> User {
    User {
        uid: session.account.uid.clone(),
        display_name: session.account.display_name.clone(),
        avatar_url: session.account.avatar_url.clone(),
    }
}
