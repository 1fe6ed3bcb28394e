//! A server: one accept loop feeding admitted transports into session
//! connection tasks, with admission limits and accept backoff.

use std::sync::Arc;

use async_trait::async_trait;
use wamp_proto::{Codec, CodecId, JsonCodec};

use crate::admission::{AcceptBackoffTimer, Admission, ConnectionAdmitter};
use crate::auth::{AnonymousAuthenticator, Authenticator};
use crate::config::ServerOptions;
use crate::connection::SessionConnection;
use crate::router::RealmDirectory;
use crate::task::{ChildTask, ShutdownSignal, Task};
use crate::transport::{AdmitMode, Transport, TransportAcceptor};

/// The codecs a server accepts, looked up by the id its transports
/// negotiate.
#[derive(Clone)]
pub struct CodecSet {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecSet {
    /// JSON only; MsgPack/CBOR implementations are added by embedders.
    pub fn new() -> Self {
        CodecSet {
            codecs: vec![Arc::new(JsonCodec)],
        }
    }

    pub fn with(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs.push(codec);
        self
    }

    pub fn get(&self, id: CodecId) -> Option<Arc<dyn Codec>> {
        self.codecs.iter().find(|codec| codec.id() == id).map(Arc::clone)
    }
}

impl Default for CodecSet {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct ServerTask {
    pub options: ServerOptions,
    pub acceptor: Box<dyn TransportAcceptor>,
    pub codecs: CodecSet,
    pub realms: RealmDirectory,
    pub admitter: Arc<ConnectionAdmitter>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl ServerTask {
    pub(crate) fn new(
        options: ServerOptions,
        acceptor: Box<dyn TransportAcceptor>,
        codecs: CodecSet,
        realms: RealmDirectory,
        admitter: Arc<ConnectionAdmitter>,
    ) -> Self {
        let authenticator = options
            .authenticator()
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::new(AnonymousAuthenticator::new()));
        ServerTask {
            options,
            acceptor,
            codecs,
            realms,
            admitter,
            authenticator,
        }
    }

    fn spawn_connection(&self, transport: Box<dyn Transport>, shutdown_signal: ShutdownSignal) {
        let peer = transport.peer();
        let connection = SessionConnection {
            server_name: self.options.name.clone(),
            agent: self.options.agent.clone(),
            transport,
            codecs: self.codecs.clone(),
            authenticator: Arc::clone(&self.authenticator),
            realms: self.realms.clone(),
            guard: self.admitter.register(),
            admit_mode: AdmitMode::Accept,
            hello_timeout: self.options.hello_timeout,
            challenge_timeout: self.options.challenge_timeout,
            shutdown_signal,
        };

        ChildTask::spawn(async move {
            if let Err(error) = connection.serve().await {
                tracing::error!(error = format!("{error:#}"), %peer, "Peer failure");
            }
        })
        .detach();
    }

    /// Refuse at handshake time without allocating any session state.
    fn spawn_shed(&self, mut transport: Box<dyn Transport>) {
        let peer = transport.peer();
        tracing::warn!(%peer, "Hard connection limit reached, shedding connection");
        ChildTask::spawn(async move {
            let _ = transport.admit(AdmitMode::Shed).await;
            transport.close();
        })
        .detach();
    }
}

#[async_trait]
impl Task for ServerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "server";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tracing::info!(
            server = %self.options.name,
            endpoint = %self.acceptor.local_endpoint(),
            "Server started"
        );

        let mut backoff = AcceptBackoffTimer::new(self.options.accept_backoff);

        loop {
            tokio::select! {
                accepted = self.acceptor.accept() => {
                    match accepted {
                        Ok(transport) => {
                            backoff.reset();
                            match self.admitter.admit() {
                                Admission::Accept => {
                                    self.spawn_connection(transport, shutdown_signal.clone());
                                }
                                Admission::AcceptOverSoft => {
                                    tracing::warn!(
                                        server = %self.options.name,
                                        connections = self.admitter.connection_count(),
                                        "Soft connection limit exceeded"
                                    );
                                    self.spawn_connection(transport, shutdown_signal.clone());
                                }
                                Admission::Shed => self.spawn_shed(transport),
                            }
                        }
                        Err(error) => {
                            let delay = backoff.next_delay();
                            tracing::error!(
                                server = %self.options.name,
                                %error,
                                ?delay,
                                "Accept failure, backing off"
                            );
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = shutdown_signal.wait() => break,
                            }
                        }
                    }
                }
                () = shutdown_signal.wait() => break,
            }
        }

        tracing::info!(server = %self.options.name, "Server stopped");
        Ok(())
    }
}
