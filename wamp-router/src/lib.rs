//! An embeddable multi-realm WAMP router.
//!
//! The router accepts client sessions over pluggable [`transport`]s,
//! authenticates them through an [`auth::Authenticator`], authorizes every
//! operation through an [`authorizer::Authorizer`] chain, and routes
//! publish/subscribe events and remote procedure calls inside URI-scoped
//! [`realm`]s. Each realm runs as its own task; broker and dealer state is
//! never shared across threads, so routing needs no locks.
//!
//! Concrete byte-stream transports, codec byte-level serialization beyond
//! JSON, and client APIs are out of scope; the corresponding contracts live
//! in [`transport`] and in `wamp_proto::codec`.

pub mod access_log;
mod admission;
pub mod auth;
pub mod authorizer;
mod broker;
pub mod cache;
pub mod config;
mod connection;
mod dealer;
pub mod disclosure;
pub mod error;
pub mod features;
pub mod ids;
mod meta;
pub mod realm;
pub mod router;
pub mod server;
pub mod session;
pub mod task;
pub mod transport;
pub mod trie;
pub mod uri;
pub mod utils;

pub use auth::{AnonymousAuthenticator, AuthDecision, AuthExchange, AuthInfo, Authenticator, PostingAuthenticator};
pub use authorizer::{Authorization, Authorizer, CachingAuthorizer, DefaultAuthorizer, PostingAuthorizer};
pub use config::{AcceptBackoff, CallTimeoutForwardingRule, RealmOptions, RouterOptions, ServerOptions};
pub use disclosure::{DisclosurePolicy, DisclosureRule};
pub use error::{CloseReason, WampError};
pub use realm::{
    InvocationPolicy, JoinGrant, JoinRequest, RealmHandle, RealmObserver, RegistrationDetails,
    RegistrationLists, SubscriptionDetails, SubscriptionLists,
};
pub use router::{RealmDirectory, Router, RouterError};
pub use server::CodecSet;
pub use session::SessionInfo;
pub use uri::{MatchPolicy, Uri, UriValidation};
