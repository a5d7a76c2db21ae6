/// Sessions: the public entry point of the driver
///
/// A session pairs an options mapping with a shared `Cluster`. Deriving a
/// session with extra options (`with`) copies the mapping and reuses the
/// cluster, so it never reconnects.
use crate::cluster::{Cluster, ClusterOptions, StalePrimaryPolicy};
use crate::config::DriverConfig;
use crate::core::{PooledSocket, Role, TcpConnector};
use crate::database::Database;
use crate::error::{EnlaceError, EnlaceResult};
use crate::options::{Consistency, Options, Safe, Seeds, DATABASE};
use crate::protocol::{KillCursors, Message, Query, QueryFlags, Reply};
use crate::utils::split_namespace;
use bson::{Bson, Document};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Error codes servers use for "not master"
const NOT_PRIMARY_CODES: [i64; 3] = [10107, 13435, 10058];

pub(crate) struct SessionInner {
    options: RwLock<Options>,
    cluster: Arc<Cluster>,
    /// Memoized current database; its name is the memo key
    current_database: Mutex<Option<Database>>,
}

/// Handle for issuing operations against one cluster with one set of options
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session over a new cluster seeded with `seeds`, dialed over
    /// TCP with default cluster options. Seeds are not checked here;
    /// malformed addresses fail on first use.
    pub fn new<S, O>(seeds: S, options: O) -> Self
    where
        S: Into<Seeds>,
        O: Into<Options>,
    {
        let cluster = Cluster::new(
            seeds,
            ClusterOptions::default(),
            Arc::new(TcpConnector::default()),
        );
        Self::with_cluster(Arc::new(cluster), options)
    }

    /// Create a session over an existing cluster
    pub fn with_cluster<O: Into<Options>>(cluster: Arc<Cluster>, options: O) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                options: RwLock::new(options.into()),
                cluster,
                current_database: Mutex::new(None),
            }),
        }
    }

    /// Create a session from a validated configuration file
    pub fn from_config(config: &DriverConfig) -> EnlaceResult<Self> {
        config.validate()?;

        let connector = TcpConnector::new(config.connect_timeout()).with_keepalive(config.keepalive());
        let cluster = Cluster::new(
            config.cluster.seeds.clone(),
            config.to_cluster_options()?,
            Arc::new(connector),
        );
        Ok(Self::with_cluster(Arc::new(cluster), config.to_options()))
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Another handle to this same session
    fn handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// A copy of the current options
    pub fn options(&self) -> Options {
        self.inner.options.read().clone()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.inner.cluster
    }

    /// The database named by the `database` option. Repeated calls return
    /// the same instance until the option changes.
    pub fn current_database(&self) -> EnlaceResult<Database> {
        let name = self
            .inner
            .options
            .read()
            .database()
            .map(str::to_string)
            .ok_or_else(|| {
                EnlaceError::configuration("no database selected; set the `database` option or call use_database")
            })?;
        Ok(self.database_for(name))
    }

    fn database_for(&self, name: String) -> Database {
        let mut memo = self.inner.current_database.lock();
        if let Some(database) = memo.as_ref() {
            if database.name() == name {
                return database.clone();
            }
        }

        debug!("Switching current database to {}", name);
        let database = Database::new(Arc::downgrade(&self.inner), name);
        *memo = Some(database.clone());
        database
    }

    /// Point this session at database `name`. Establishes the current
    /// database right away if none was established yet.
    pub fn use_database(&self, name: &str) {
        self.inner.options.write().insert(DATABASE, name);

        let established = self.inner.current_database.lock().is_some();
        if !established {
            self.database_for(name.to_string());
        }
    }

    /// A new session over the same cluster whose options are this session's
    /// merged with `extra`. This session is left unchanged.
    pub fn with<O: Into<Options>>(&self, extra: O) -> Session {
        let options = self.options().merge(&extra.into());
        Session::with_cluster(Arc::clone(&self.inner.cluster), options)
    }

    /// Run `f` with a session derived by `with`, discard its output, and
    /// return the derived session
    pub async fn with_scope<O, F, Fut>(&self, extra: O, f: F) -> Session
    where
        O: Into<Options>,
        F: FnOnce(Session) -> Fut,
        Fut: Future,
    {
        let derived = self.with(extra);
        f(derived.handle()).await;
        derived
    }

    fn consistency(&self) -> EnlaceResult<Consistency> {
        self.inner.options.read().consistency()
    }

    /// Check out a socket to a node that can serve `role`. The socket goes
    /// back to its pool when the guard drops.
    pub async fn socket_for(&self, role: Role) -> EnlaceResult<PooledSocket> {
        let consistency = self.consistency()?;
        let node = self.inner.cluster.route(role, consistency).await?;

        match node.acquire().await {
            Ok(socket) => Ok(socket),
            Err(e) => {
                self.inner.cluster.mark_down(node.address(), e.to_string());
                Err(e)
            }
        }
    }

    /// Send an insert, update or delete to the primary.
    ///
    /// With `safe` set the write is followed by `getlasterror` on the same
    /// socket and that reply is returned; otherwise returns `None` once the
    /// message is written.
    pub async fn execute_write<M: Into<Message>>(&self, message: M) -> EnlaceResult<Option<Document>> {
        let message = message.into();
        if !matches!(message, Message::Insert(_) | Message::Update(_) | Message::Delete(_)) {
            return Err(EnlaceError::configuration(format!(
                "{} is not a write operation",
                message.op_code()
            )));
        }

        match self.write_once(&message).await {
            Err(EnlaceError::NotPrimary { address })
                if self.inner.cluster.options().stale_primary == StalePrimaryPolicy::Retry =>
            {
                info!("Retrying write rejected by former primary {}", address);
                self.write_once(&message).await
            }
            result => result,
        }
    }

    async fn write_once(&self, message: &Message) -> EnlaceResult<Option<Document>> {
        let safe = self.inner.options.read().safe();
        let mut socket = self.socket_for(Role::Write).await?;
        socket.send(message.clone()).await?;

        let command = match safe {
            Safe::Off => return Ok(None),
            Safe::On(command) => command,
        };

        let database = message
            .full_collection_name()
            .map(|namespace| split_namespace(namespace).0)
            .unwrap_or("admin");
        let reply = socket.simple_query(Query::command(database, command)).await?;

        if reports_not_primary(&reply) {
            let address = socket.address().to_string();
            drop(socket);
            self.inner.cluster.observe_not_primary(&address);
            return Err(EnlaceError::NotPrimary { address });
        }
        Ok(Some(reply))
    }

    pub async fn insert<S: Into<String>>(
        &self,
        collection: S,
        documents: Vec<Document>,
    ) -> EnlaceResult<Option<Document>> {
        let namespace = self.namespace(collection.into())?;
        self.execute_write(crate::protocol::Insert::new(namespace, documents))
            .await
    }

    pub async fn update<S: Into<String>>(
        &self,
        collection: S,
        selector: Document,
        update: Document,
    ) -> EnlaceResult<Option<Document>> {
        let namespace = self.namespace(collection.into())?;
        self.execute_write(crate::protocol::Update::new(namespace, selector, update))
            .await
    }

    pub async fn remove<S: Into<String>>(
        &self,
        collection: S,
        selector: Document,
    ) -> EnlaceResult<Option<Document>> {
        let namespace = self.namespace(collection.into())?;
        self.execute_write(crate::protocol::Delete::new(namespace, selector))
            .await
    }

    /// `<current database>.<collection>`
    fn namespace(&self, collection: String) -> EnlaceResult<String> {
        let database = self.current_database()?;
        Ok(format!("{}.{}", database.name(), collection))
    }

    /// Run a query on a node chosen for reading. Eventual consistency sets
    /// the slave-ok flag. A query failure is returned in the reply.
    pub async fn query(&self, mut query: Query) -> EnlaceResult<Reply> {
        if self.consistency()? == Consistency::Eventual {
            query.flags.insert(QueryFlags::SLAVE_OK);
        }

        let mut socket = self.socket_for(Role::Read).await?;
        let reply = socket.execute(query).await?;

        if reply.is_query_failure() && reply.documents.first().map_or(false, reports_not_primary) {
            let address = socket.address().to_string();
            drop(socket);
            self.inner.cluster.observe_not_primary(&address);
        }
        Ok(reply)
    }

    /// Tell the primary to close server-side cursors
    pub async fn kill_cursors(&self, cursor_ids: Vec<i64>) -> EnlaceResult<()> {
        if cursor_ids.is_empty() {
            return Ok(());
        }
        let mut socket = self.socket_for(Role::Write).await?;
        socket.send(KillCursors { cursor_ids }).await?;
        Ok(())
    }
}

/// Whether a `getlasterror` or query failure document says the node is not
/// primary
fn reports_not_primary(reply: &Document) -> bool {
    let message = ["err", "$err", "errmsg"]
        .iter()
        .filter_map(|key| reply.get_str(key).ok())
        .any(|message| message.contains("not master"));

    let code = match reply.get("code") {
        Some(Bson::Int32(code)) => Some(i64::from(*code)),
        Some(Bson::Int64(code)) => Some(*code),
        Some(Bson::Double(code)) => Some(*code as i64),
        _ => None,
    };

    message || code.map_or(false, |code| NOT_PRIMARY_CODES.contains(&code))
}

impl PartialEq for Session {
    /// Handles are equal when they refer to the same session
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("options", &*self.inner.options.read())
            .field("cluster", &self.inner.cluster)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::RefreshPolicy;
    use crate::core::NodeRole;
    use crate::protocol::OpCode;
    use crate::testing::{ismaster_primary, ismaster_secondary, MockReplicaSet};
    use bson::doc;

    const A: &str = "a:27017";
    const B: &str = "b:27017";

    fn replica_set() -> MockReplicaSet {
        let set = MockReplicaSet::new();
        set.add_server(A, ismaster_primary(A, &[A, B]));
        set.add_server(B, ismaster_secondary(B, Some(A), &[A, B]));
        set
    }

    fn cluster_with(set: &MockReplicaSet, stale_primary: StalePrimaryPolicy) -> Arc<Cluster> {
        Arc::new(Cluster::new(
            [A, B],
            ClusterOptions {
                refresh: RefreshPolicy::manual(),
                stale_primary,
                ..Default::default()
            },
            set.connector(),
        ))
    }

    fn session<O: Into<Options>>(set: &MockReplicaSet, options: O) -> Session {
        Session::with_cluster(cluster_with(set, StalePrimaryPolicy::Surface), options)
    }

    #[test]
    fn test_options_are_copied_in_and_out() {
        let mut options = Options::new().set("database", "app").set("retries", 2);
        let session = Session::new("a:27017,b:27017", options.clone());
        assert_eq!(session.options(), options);

        // Changing the caller's mapping leaves the session alone
        options.insert("database", "other");
        assert_eq!(session.options().database(), Some("app"));

        // And so does changing a returned copy
        let mut copy = session.options();
        copy.insert("safe", true);
        assert!(session.options().get("safe").is_none());
    }

    #[test]
    fn test_malformed_seeds_are_accepted() {
        let session = Session::new("not a seed, ,", Options::new());
        assert_eq!(session.cluster().seeds().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_seed_fails_on_first_use() {
        let session = Session::new("not a seed", Options::new());
        let result = session.socket_for(Role::Write).await;
        assert!(matches!(result, Err(EnlaceError::ConnectionFailure { .. })));
    }

    #[test]
    fn test_current_database_requires_option() {
        let session = Session::new("a:27017", Options::new());
        assert!(matches!(
            session.current_database(),
            Err(EnlaceError::Configuration { .. })
        ));
    }

    #[test]
    fn test_current_database_is_memoized() {
        let session = Session::new("a:27017", Options::new().set("database", "app"));
        let first = session.current_database().unwrap();
        let second = session.current_database().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name(), "app");
        assert!(first.session().unwrap() == session);

        session.use_database("other");
        let third = session.current_database().unwrap();
        assert_ne!(first, third);
        assert_eq!(third.name(), "other");
    }

    #[test]
    fn test_use_database_establishes_current_database() {
        let session = Session::new("a:27017", Options::new());
        assert!(session.inner.current_database.lock().is_none());

        session.use_database("admin");
        assert_eq!(session.options().database(), Some("admin"));

        let established = session.inner.current_database.lock().clone().unwrap();
        assert_eq!(established.name(), "admin");
        assert_eq!(established, session.current_database().unwrap());
    }

    #[test]
    fn test_use_database_keeps_existing_memo_until_accessed() {
        let session = Session::new("a:27017", Options::new().set("database", "app"));
        let app = session.current_database().unwrap();

        session.use_database("admin");
        let memo = session.inner.current_database.lock().clone().unwrap();
        assert_eq!(memo, app);
        assert_eq!(session.current_database().unwrap().name(), "admin");
    }

    #[test]
    fn test_with_merges_without_touching_original() {
        let base = Options::new().set("database", "app").set("safe", false);
        let session = Session::new("a:27017", base.clone());
        let extra = Options::new().set("safe", true).set("consistency", "eventual");

        let derived = session.with(extra.clone());
        assert_eq!(derived.options(), base.merge(&extra));
        assert!(derived != session);
        assert_eq!(session.options(), base);
        assert!(Arc::ptr_eq(derived.cluster(), session.cluster()));

        // Later changes on either side stay on that side
        derived.use_database("admin");
        assert_eq!(session.options().database(), Some("app"));
    }

    #[tokio::test]
    async fn test_with_scope() {
        let base = Options::new().set("database", "app");
        let session = Session::new("a:27017", base.clone());
        let extra = Options::new().set("safe", true);

        let seen = Arc::new(Mutex::new(None));
        let returned = {
            let seen = Arc::clone(&seen);
            session
                .with_scope(extra.clone(), |scoped| async move {
                    scoped.use_database("scratch");
                    *seen.lock() = Some(scoped.options());
                    "ignored"
                })
                .await
        };

        let seen = seen.lock().clone().unwrap();
        assert_eq!(seen.database(), Some("scratch"));
        assert_eq!(seen.get("safe"), Some(&Bson::Boolean(true)));
        assert_eq!(returned.options(), seen);
        assert!(returned != session);
        assert_eq!(session.options(), base);
    }

    #[tokio::test]
    async fn test_socket_for_routes_by_role() {
        let set = replica_set();
        let strong = session(&set, Options::new());
        assert_eq!(strong.socket_for(Role::Write).await.unwrap().address(), A);
        assert_eq!(strong.socket_for(Role::Read).await.unwrap().address(), A);

        let eventual = strong.with(Options::new().set("consistency", "eventual"));
        assert_eq!(eventual.socket_for(Role::Read).await.unwrap().address(), B);
        assert_eq!(eventual.socket_for(Role::Write).await.unwrap().address(), A);
    }

    #[tokio::test]
    async fn test_invalid_consistency_is_configuration_error() {
        let set = replica_set();
        let session = session(&set, Options::new().set("consistency", "whenever"));
        let result = session.socket_for(Role::Read).await;
        assert!(matches!(result, Err(EnlaceError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_unsafe_write_is_fire_and_forget() {
        let set = replica_set();
        let session = session(&set, Options::new().set("database", "app"));

        let result = session
            .insert("users", vec![doc! { "name": "ana" }])
            .await
            .unwrap();
        assert_eq!(result, None);

        // Follow with a command on the same primary so the insert has landed
        session
            .current_database()
            .unwrap()
            .command(doc! { "ping": 1 })
            .await
            .unwrap();
        let inserts: Vec<_> = set
            .received(A)
            .into_iter()
            .filter(|message| message.op_code() == OpCode::Insert)
            .collect();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].full_collection_name(), Some("app.users"));
        assert!(set.received(B).iter().all(|m| m.op_code() == OpCode::Query));
    }

    #[tokio::test]
    async fn test_safe_write_returns_last_error() {
        let set = replica_set();
        set.set_last_error(A, doc! { "ok": 1.0, "err": Bson::Null, "n": 3 });
        let session = session(
            &set,
            Options::new().set("database", "app").set("safe", doc! { "w": 2 }),
        );

        let result = session
            .update("users", doc! { "active": false }, doc! { "$set": { "active": true } })
            .await
            .unwrap();
        assert_eq!(result.unwrap().get_i32("n").unwrap(), 3);

        let last = set.queries(A).pop().unwrap();
        assert_eq!(last.full_collection_name, "app.$cmd");
        assert_eq!(last.selector, doc! { "getlasterror": 1, "w": 2 });
    }

    #[tokio::test]
    async fn test_stale_primary_is_surfaced() {
        let set = replica_set();
        set.set_last_error(A, doc! { "ok": 1.0, "err": "not master", "code": 10107 });
        let session = session(&set, Options::new().set("database", "app").set("safe", true));

        let result = session.remove("users", doc! { "name": "ana" }).await;
        match result {
            Err(EnlaceError::NotPrimary { address }) => assert_eq!(address, A),
            other => panic!("expected NotPrimary, got {:?}", other),
        }
        assert_eq!(session.cluster().primary(), None);
        assert_eq!(session.cluster().node(A).unwrap().role(), NodeRole::Unknown);
    }

    #[tokio::test]
    async fn test_stale_primary_retry_reaches_new_primary() {
        let set = replica_set();
        let cluster = cluster_with(&set, StalePrimaryPolicy::Retry);
        cluster.refresh().await.unwrap();

        // An election happens behind the driver's back
        set.set_ismaster(A, ismaster_secondary(A, Some(B), &[A, B]));
        set.set_ismaster(B, ismaster_primary(B, &[A, B]));
        set.set_last_error(A, doc! { "ok": 1.0, "err": "not master" });

        let session = Session::with_cluster(cluster, Options::new().set("database", "app").set("safe", true));
        let result = session.insert("users", vec![doc! { "name": "ana" }]).await.unwrap();
        assert!(result.is_some());

        assert_eq!(session.cluster().primary().as_deref(), Some(B));
        let landed = set
            .received(B)
            .iter()
            .filter(|message| message.op_code() == OpCode::Insert)
            .count();
        assert_eq!(landed, 1);
    }

    #[tokio::test]
    async fn test_execute_write_rejects_queries() {
        let set = replica_set();
        let session = session(&set, Options::new());
        let result = session
            .execute_write(Query::new("app.users", doc! {}))
            .await;
        assert!(matches!(result, Err(EnlaceError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_eventual_query_sets_slave_ok() {
        let set = replica_set();
        set.set_query_results(B, vec![doc! { "name": "ana" }, doc! { "name": "bo" }]);
        let session = session(&set, Options::new().set("consistency", "eventual"));

        let reply = session
            .query(Query::new("app.users", doc! {}).limit(10))
            .await
            .unwrap();
        assert_eq!(reply.documents.len(), 2);

        let sent = set.queries(B).pop().unwrap();
        assert!(sent.flags.contains(QueryFlags::SLAVE_OK));
        assert_eq!(sent.limit, 10);
    }

    #[tokio::test]
    async fn test_kill_cursors_goes_to_primary() {
        let set = replica_set();
        let session = session(&set, Options::new().set("database", "app"));

        session.kill_cursors(vec![]).await.unwrap();
        session.kill_cursors(vec![42, 43]).await.unwrap();
        session
            .current_database()
            .unwrap()
            .command(doc! { "ping": 1 })
            .await
            .unwrap();

        let killed: Vec<_> = set
            .received(A)
            .into_iter()
            .filter_map(|message| match message {
                Message::KillCursors(kill) => Some(kill.cursor_ids),
                _ => None,
            })
            .collect();
        assert_eq!(killed, vec![vec![42, 43]]);
    }

    #[test]
    fn test_reports_not_primary() {
        assert!(reports_not_primary(&doc! { "err": "not master" }));
        assert!(reports_not_primary(&doc! { "$err": "not master and slaveOk=false", "code": 13435 }));
        assert!(reports_not_primary(&doc! { "err": "x", "code": 10058_i64 }));
        assert!(!reports_not_primary(&doc! { "err": Bson::Null, "ok": 1.0 }));
        assert!(!reports_not_primary(&doc! { "err": "E11000 duplicate key", "code": 11000 }));
    }
}
