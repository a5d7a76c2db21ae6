/// Named databases bound to a session
use crate::core::Role;
use crate::error::{EnlaceError, EnlaceResult};
use crate::protocol::Query;
use crate::session::{Session, SessionInner};
use bson::{doc, Document};
use std::fmt;
use std::sync::{Arc, Weak};

/// A database on the cluster of the session that created it.
///
/// Cloning is cheap and clones compare equal; handles from separate
/// `Database` instances never do, even under the same name. Holds only a
/// weak reference to the session. Every command routes to the primary at
/// call time.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    session: Weak<SessionInner>,
    name: String,
}

impl Database {
    pub(crate) fn new(session: Weak<SessionInner>, name: String) -> Self {
        Self {
            inner: Arc::new(DatabaseInner { session, name }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The owning session, unless every handle to it was dropped
    pub fn session(&self) -> Option<Session> {
        self.inner.session.upgrade().map(Session::from_inner)
    }

    /// Run a command against `<name>.$cmd` on the primary and return the
    /// reply document. A reply with `ok: 0` is returned as is.
    pub async fn command(&self, command: Document) -> EnlaceResult<Document> {
        let session = self.session().ok_or_else(|| {
            EnlaceError::configuration(format!(
                "session owning database '{}' was dropped",
                self.name()
            ))
        })?;

        let mut socket = session.socket_for(Role::Write).await?;
        socket.simple_query(Query::command(self.name(), command)).await
    }

    /// `dropDatabase`
    pub async fn drop(&self) -> EnlaceResult<Document> {
        self.command(doc! { "dropDatabase": 1 }).await
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Database {}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("name", &self.name()).finish()
    }
}
