//! The router: process-wide owner of realms and servers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::admission::{ConnectionAdmitter, MonitorTask};
use crate::config::{RealmOptions, RouterOptions, ServerOptions};
use crate::realm::{RealmHandle, RealmTask};
use crate::server::{CodecSet, ServerTask};
use crate::task::{ChildTask, ShutdownHandle, TaskSet, spawn_task};
use crate::transport::TransportAcceptor;
use crate::uri::Uri;

/// Realm lookup table shared with servers and their connection tasks.
#[derive(Clone, Default)]
pub struct RealmDirectory {
    inner: Arc<RwLock<HashMap<Uri, RealmHandle>>>,
}

impl RealmDirectory {
    pub fn get(&self, uri: &Uri) -> Option<RealmHandle> {
        self.inner.read().get(uri).cloned()
    }

    pub fn uris(&self) -> Vec<Uri> {
        self.inner.read().keys().cloned().collect()
    }

    fn insert(&self, handle: RealmHandle) -> Result<(), RouterError> {
        let mut realms = self.inner.write();
        let uri = handle.uri().clone();
        if realms.contains_key(&uri) {
            return Err(RouterError::RealmAlreadyExists(uri));
        }
        realms.insert(uri, handle);
        Ok(())
    }

    fn remove(&self, uri: &Uri) -> Option<RealmHandle> {
        self.inner.write().remove(uri)
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("realm `{0}` already exists")]
    RealmAlreadyExists(Uri),
    #[error("no such realm `{0}`")]
    NoSuchRealm(Uri),
    #[error("server `{0}` already exists")]
    ServerAlreadyExists(String),
    #[error("no such server `{0}`")]
    NoSuchServer(String),
    #[error("router is closed")]
    Closed,
}

struct ServerEntry {
    shutdown: ShutdownHandle,
    tasks: Vec<ChildTask<anyhow::Result<()>>>,
}

/// An embeddable multi-realm WAMP router.
///
/// Lifecycle: construct, open realms and servers, then [`Router::close`];
/// every internal task has completed by the time `close()` returns.
pub struct Router {
    options: RouterOptions,
    realms: RealmDirectory,
    servers: Mutex<HashMap<String, ServerEntry>>,
    tasks: Mutex<Option<TaskSet>>,
}

impl Router {
    pub fn new(options: RouterOptions) -> Self {
        Router {
            options,
            realms: RealmDirectory::default(),
            servers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Some(TaskSet::new())),
        }
    }

    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// The realm lookup table, for embedders driving sessions over custom
    /// plumbing.
    pub fn realms(&self) -> &RealmDirectory {
        &self.realms
    }

    pub fn realm(&self, uri: &Uri) -> Option<RealmHandle> {
        self.realms.get(uri)
    }

    /// Opens a realm, failing when its URI is already taken.
    pub fn open_realm(&self, options: RealmOptions) -> Result<RealmHandle, RouterError> {
        let realm = RealmTask::new(options, &self.options);
        let handle = realm.handle();
        self.realms.insert(handle.clone())?;

        let mut tasks = self.tasks.lock();
        let Some(tasks) = tasks.as_mut() else {
            self.realms.remove(handle.uri());
            return Err(RouterError::Closed);
        };
        tasks.register(realm);

        tracing::info!(realm = %handle.uri(), "Realm opened");
        Ok(handle)
    }

    /// Initiates shutdown of one realm; its sessions close with
    /// `wamp.close.close_realm`.
    pub async fn close_realm(&self, uri: &Uri) -> Result<(), RouterError> {
        let handle = self
            .realms
            .remove(uri)
            .ok_or_else(|| RouterError::NoSuchRealm(uri.clone()))?;
        handle.close().await;
        Ok(())
    }

    /// Starts a server: an accept loop over `acceptor` plus its connection
    /// monitor.
    pub fn open_server(
        &self,
        options: ServerOptions,
        acceptor: Box<dyn TransportAcceptor>,
        codecs: CodecSet,
    ) -> Result<(), RouterError> {
        let name = options.name.clone();

        let mut servers = self.servers.lock();
        if servers.contains_key(&name) {
            return Err(RouterError::ServerAlreadyExists(name));
        }

        let admitter = ConnectionAdmitter::new(&options);
        let (shutdown, signal) = ShutdownHandle::new();

        let monitor = MonitorTask {
            admitter: Arc::clone(&admitter),
            interval: options.monitoring_interval,
        };
        let server = ServerTask::new(options, acceptor, codecs, self.realms.clone(), admitter);

        let tasks = vec![
            spawn_task(server, signal.clone()),
            spawn_task(monitor, signal.clone()),
        ];
        drop(signal);

        servers.insert(name.clone(), ServerEntry { shutdown, tasks });
        tracing::info!(server = %name, "Server opened");
        Ok(())
    }

    /// Gracefully shuts one server down, waiting for its sessions.
    pub async fn close_server(&self, name: &str) -> Result<(), RouterError> {
        let entry = self
            .servers
            .lock()
            .remove(name)
            .ok_or_else(|| RouterError::NoSuchServer(name.to_owned()))?;
        close_server_entry(name, entry).await;
        Ok(())
    }

    /// Shuts everything down: servers first (so no new sessions arrive),
    /// then realms. Returns once every internal task has completed.
    pub async fn close(self) {
        tracing::info!("Closing router");

        let servers: Vec<(String, ServerEntry)> = self.servers.lock().drain().collect();
        for (name, entry) in servers {
            close_server_entry(&name, entry).await;
        }

        for uri in self.realms.uris() {
            if let Some(handle) = self.realms.remove(&uri) {
                handle.close().await;
            }
        }

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shut_down().await;
        }

        tracing::info!("Router closed");
    }
}

async fn close_server_entry(name: &str, entry: ServerEntry) {
    tracing::info!(server = %name, "Closing server");
    entry.shutdown.signal();
    let results = futures::future::join_all(entry.tasks.into_iter().map(ChildTask::join)).await;
    for result in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::error!(server = %name, error = format!("{error:#}"), "Server task failed"),
            Err(error) => tracing::error!(server = %name, %error, "Server task panicked"),
        }
    }
    // Connection tasks hold signal clones; they are done once all clones
    // are dropped.
    entry.shutdown.all_closed().await;
}
