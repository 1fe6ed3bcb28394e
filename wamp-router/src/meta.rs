//! The meta-API: built-in `wamp.session.*`, `wamp.subscription.*` and
//! `wamp.registration.*` procedures.
//!
//! Dispatch runs on the realm task with read-only views of the routing
//! state; session kills are returned as an outcome for the realm to
//! execute, keeping all mutation in one place. Meta *events* are published
//! by the realm through the ordinary broker path.

use std::collections::HashMap;

use wamp_proto::{Array, Object, Variant};

use crate::broker::{Broker, SubscriptionDetails};
use crate::dealer::{Dealer, RegistrationDetails};
use crate::error::{CloseReason, InteractionError, WampError};
use crate::ids::SessionId;
use crate::realm::SessionRecord;
use crate::session::SessionInfo;
use crate::uri::{MatchPolicy, Uri, UriValidation};
use crate::utils::{TimestampPrecision, format_rfc3339_utc};

/// Read-only view of realm state for one meta call.
pub(crate) struct MetaContext<'a> {
    pub sessions: &'a HashMap<SessionId, SessionRecord>,
    pub broker: &'a Broker,
    pub dealer: &'a Dealer,
    pub precision: TimestampPrecision,
    pub caller: SessionId,
}

/// What the realm should do with a meta call.
pub(crate) enum MetaOutcome {
    Reply {
        args: Option<Array>,
        kwargs: Option<Object>,
    },
    Error(InteractionError),
    /// Kill the targets, then answer the caller with `reply`.
    Kill {
        targets: Vec<SessionId>,
        reason: String,
        message: Option<String>,
        reply: Option<Array>,
    },
}

impl MetaOutcome {
    fn reply_with(args: Array) -> Self {
        MetaOutcome::Reply {
            args: Some(args),
            kwargs: None,
        }
    }

    fn error(kind: WampError) -> Self {
        MetaOutcome::Error(InteractionError::new(kind))
    }
}

pub(crate) fn dispatch(
    ctx: MetaContext<'_>,
    procedure: &Uri,
    args: Option<&Array>,
    kwargs: Option<&Object>,
) -> MetaOutcome {
    let args = args.map(Vec::as_slice).unwrap_or_default();

    match procedure.as_str() {
        "wamp.session.count" => session_count(&ctx, args),
        "wamp.session.list" => session_list(&ctx, args),
        "wamp.session.get" => session_get(&ctx, args),
        "wamp.session.kill" => session_kill(&ctx, args, kwargs),
        "wamp.session.kill_by_authid" => kill_by(&ctx, args, kwargs, |info, value| info.auth.id == value),
        "wamp.session.kill_by_authrole" => {
            kill_by(&ctx, args, kwargs, |info, value| info.auth.role == value)
        }
        "wamp.session.kill_all" => kill_all(&ctx, kwargs),
        "wamp.subscription.list" => subscription_list(&ctx),
        "wamp.subscription.get" => subscription_get(&ctx, args),
        "wamp.subscription.lookup" => subscription_lookup(&ctx, args),
        "wamp.subscription.match" => subscription_match(&ctx, args),
        "wamp.subscription.subscribers" => subscription_subscribers(&ctx, args),
        "wamp.subscription.count_subscribers" => subscription_count_subscribers(&ctx, args),
        "wamp.registration.list" => registration_list(&ctx),
        "wamp.registration.get" => registration_get(&ctx, args),
        "wamp.registration.lookup" => registration_lookup(&ctx, args),
        "wamp.registration.match" => registration_match(&ctx, args),
        "wamp.registration.callees" => registration_callees(&ctx, args),
        "wamp.registration.count_callees" => registration_count_callees(&ctx, args),
        _ => MetaOutcome::error(WampError::NoSuchProcedure),
    }
}

// === Shared summaries, also used for meta-events ===

/// The session dictionary reported by `wamp.session.get` and
/// `wamp.session.on_join`.
pub(crate) fn session_summary(info: &SessionInfo) -> Object {
    let mut dict = Object::from([
        ("session".to_owned(), Variant::UInt(info.session_id)),
        ("authid".to_owned(), Variant::from(info.auth.id.as_str())),
        ("authrole".to_owned(), Variant::from(info.auth.role.as_str())),
        ("authmethod".to_owned(), Variant::from(info.auth.method.as_str())),
        ("authprovider".to_owned(), Variant::from(info.auth.provider.as_str())),
    ]);
    if let Some(agent) = &info.agent {
        dict.insert("agent".to_owned(), Variant::from(agent.as_str()));
    }
    dict
}

pub(crate) fn subscription_summary(details: &SubscriptionDetails, precision: TimestampPrecision) -> Object {
    Object::from([
        ("id".to_owned(), Variant::UInt(details.id)),
        (
            "created".to_owned(),
            Variant::String(format_rfc3339_utc(details.created, precision)),
        ),
        ("uri".to_owned(), Variant::from(details.uri.as_str())),
        ("match".to_owned(), Variant::from(details.match_policy.as_str())),
    ])
}

pub(crate) fn registration_summary(details: &RegistrationDetails, precision: TimestampPrecision) -> Object {
    Object::from([
        ("id".to_owned(), Variant::UInt(details.id)),
        (
            "created".to_owned(),
            Variant::String(format_rfc3339_utc(details.created, precision)),
        ),
        ("uri".to_owned(), Variant::from(details.uri.as_str())),
        ("match".to_owned(), Variant::from(details.match_policy.as_str())),
        ("invoke".to_owned(), Variant::from(details.invocation_policy.as_str())),
    ])
}

// === Argument helpers ===

fn role_filter(args: &[Variant]) -> Option<Vec<String>> {
    let list = args.first()?.as_array()?;
    Some(list.iter().filter_map(Variant::as_str).map(str::to_owned).collect())
}

fn want_u64(args: &[Variant], index: usize) -> Result<u64, MetaOutcome> {
    args.get(index)
        .and_then(Variant::as_u64)
        .ok_or_else(|| MetaOutcome::error(WampError::InvalidArgument))
}

fn want_str<'a>(args: &'a [Variant], index: usize) -> Result<&'a str, MetaOutcome> {
    args.get(index)
        .and_then(Variant::as_str)
        .ok_or_else(|| MetaOutcome::error(WampError::InvalidArgument))
}

fn match_option(args: &[Variant], index: usize) -> Result<MatchPolicy, MetaOutcome> {
    let requested = args
        .get(index)
        .and_then(Variant::as_object)
        .and_then(|options| options.get("match"))
        .and_then(Variant::as_str);
    MatchPolicy::from_option(requested).ok_or_else(|| MetaOutcome::error(WampError::InvalidArgument))
}

/// Parses and validates the `{reason, message}` kill options.
fn kill_options(kwargs: Option<&Object>) -> Result<(String, Option<String>), MetaOutcome> {
    let reason = kwargs
        .and_then(|k| k.get("reason"))
        .and_then(Variant::as_str)
        .map_or_else(|| CloseReason::Killed.uri().to_owned(), str::to_owned);
    if !UriValidation::Relaxed.check_resource(&Uri::new(reason.clone())) {
        return Err(MetaOutcome::error(WampError::InvalidUri));
    }

    let message = kwargs
        .and_then(|k| k.get("message"))
        .and_then(Variant::as_str)
        .map(str::to_owned);

    Ok((reason, message))
}

// === wamp.session.* ===

fn sessions_matching<'a>(
    ctx: &'a MetaContext<'_>,
    roles: Option<&'a [String]>,
) -> impl Iterator<Item = &'a SessionInfo> {
    ctx.sessions.values().map(|record| &record.info).filter(move |info| {
        roles.is_none_or(|roles| roles.iter().any(|role| *role == info.auth.role))
    })
}

fn session_count(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let roles = role_filter(args);
    let count = sessions_matching(ctx, roles.as_deref()).count();
    MetaOutcome::reply_with(vec![Variant::UInt(count as u64)])
}

fn session_list(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let roles = role_filter(args);
    let mut ids: Vec<u64> = sessions_matching(ctx, roles.as_deref())
        .map(|info| info.session_id)
        .collect();
    ids.sort_unstable();
    MetaOutcome::reply_with(vec![ids.into_iter().map(Variant::UInt).collect()])
}

fn session_get(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let session_id = match want_u64(args, 0) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match ctx.sessions.get(&session_id) {
        Some(record) => MetaOutcome::reply_with(vec![Variant::Object(session_summary(&record.info))]),
        None => MetaOutcome::error(WampError::NoSuchSession),
    }
}

fn session_kill(ctx: &MetaContext<'_>, args: &[Variant], kwargs: Option<&Object>) -> MetaOutcome {
    let session_id = match want_u64(args, 0) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    if session_id == ctx.caller {
        return MetaOutcome::Error(InteractionError::with_message(
            WampError::InvalidArgument,
            "a session cannot kill itself",
        ));
    }
    if !ctx.sessions.contains_key(&session_id) {
        return MetaOutcome::error(WampError::NoSuchSession);
    }
    let (reason, message) = match kill_options(kwargs) {
        Ok(options) => options,
        Err(outcome) => return outcome,
    };

    MetaOutcome::Kill {
        targets: vec![session_id],
        reason,
        message,
        reply: None,
    }
}

fn kill_by(
    ctx: &MetaContext<'_>,
    args: &[Variant],
    kwargs: Option<&Object>,
    matches: impl Fn(&SessionInfo, &str) -> bool,
) -> MetaOutcome {
    let value = match want_str(args, 0) {
        Ok(value) => value,
        Err(outcome) => return outcome,
    };
    let (reason, message) = match kill_options(kwargs) {
        Ok(options) => options,
        Err(outcome) => return outcome,
    };

    // The killing session is never part of the kill set.
    let mut targets: Vec<SessionId> = ctx
        .sessions
        .values()
        .map(|record| &record.info)
        .filter(|info| info.session_id != ctx.caller && matches(info, value))
        .map(|info| info.session_id)
        .collect();
    targets.sort_unstable();

    let killed: Array = targets.iter().copied().map(Variant::UInt).collect();
    MetaOutcome::Kill {
        targets,
        reason,
        message,
        reply: Some(vec![Variant::Array(killed)]),
    }
}

fn kill_all(ctx: &MetaContext<'_>, kwargs: Option<&Object>) -> MetaOutcome {
    let (reason, message) = match kill_options(kwargs) {
        Ok(options) => options,
        Err(outcome) => return outcome,
    };

    let mut targets: Vec<SessionId> = ctx
        .sessions
        .keys()
        .copied()
        .filter(|&id| id != ctx.caller)
        .collect();
    targets.sort_unstable();

    let count = targets.len() as u64;
    MetaOutcome::Kill {
        targets,
        reason,
        message,
        reply: Some(vec![Variant::UInt(count)]),
    }
}

// === wamp.subscription.* ===

fn subscription_list(ctx: &MetaContext<'_>) -> MetaOutcome {
    let lists = ctx.broker.list_ids();
    let dict = Object::from([
        ("exact".to_owned(), lists.exact.into_iter().map(Variant::UInt).collect()),
        ("prefix".to_owned(), lists.prefix.into_iter().map(Variant::UInt).collect()),
        (
            "wildcard".to_owned(),
            lists.wildcard.into_iter().map(Variant::UInt).collect(),
        ),
    ]);
    MetaOutcome::reply_with(vec![Variant::Object(dict)])
}

fn subscription_get(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let id = match want_u64(args, 0) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match ctx.broker.details(id) {
        Some(details) => {
            MetaOutcome::reply_with(vec![Variant::Object(subscription_summary(&details, ctx.precision))])
        }
        None => MetaOutcome::error(WampError::NoSuchSubscription),
    }
}

fn subscription_lookup(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let topic = match want_str(args, 0) {
        Ok(topic) => topic,
        Err(outcome) => return outcome,
    };
    let policy = match match_option(args, 1) {
        Ok(policy) => policy,
        Err(outcome) => return outcome,
    };
    let found = ctx.broker.lookup(&Uri::new(topic), policy);
    MetaOutcome::reply_with(vec![found.map_or(Variant::Null, Variant::UInt)])
}

fn subscription_match(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let topic = match want_str(args, 0) {
        Ok(topic) => topic,
        Err(outcome) => return outcome,
    };
    let ids = ctx.broker.match_ids(&Uri::new(topic));
    if ids.is_empty() {
        return MetaOutcome::reply_with(vec![Variant::Null]);
    }
    MetaOutcome::reply_with(vec![ids.into_iter().map(Variant::UInt).collect()])
}

fn subscription_subscribers(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let id = match want_u64(args, 0) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match ctx.broker.details(id) {
        Some(details) => MetaOutcome::reply_with(vec![
            details.subscribers.into_iter().map(Variant::UInt).collect(),
        ]),
        None => MetaOutcome::error(WampError::NoSuchSubscription),
    }
}

fn subscription_count_subscribers(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let id = match want_u64(args, 0) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match ctx.broker.details(id) {
        Some(details) => MetaOutcome::reply_with(vec![Variant::UInt(details.subscribers.len() as u64)]),
        None => MetaOutcome::error(WampError::NoSuchSubscription),
    }
}

// === wamp.registration.* ===

fn registration_list(ctx: &MetaContext<'_>) -> MetaOutcome {
    let lists = ctx.dealer.list_ids();
    let dict = Object::from([
        ("exact".to_owned(), lists.exact.into_iter().map(Variant::UInt).collect()),
        ("prefix".to_owned(), lists.prefix.into_iter().map(Variant::UInt).collect()),
        (
            "wildcard".to_owned(),
            lists.wildcard.into_iter().map(Variant::UInt).collect(),
        ),
    ]);
    MetaOutcome::reply_with(vec![Variant::Object(dict)])
}

fn registration_get(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let id = match want_u64(args, 0) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match ctx.dealer.details(id) {
        Some(details) => {
            MetaOutcome::reply_with(vec![Variant::Object(registration_summary(&details, ctx.precision))])
        }
        None => MetaOutcome::error(WampError::NoSuchRegistration),
    }
}

fn registration_lookup(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let procedure = match want_str(args, 0) {
        Ok(procedure) => procedure,
        Err(outcome) => return outcome,
    };
    let policy = match match_option(args, 1) {
        Ok(policy) => policy,
        Err(outcome) => return outcome,
    };
    let found = ctx.dealer.lookup(&Uri::new(procedure), policy);
    MetaOutcome::reply_with(vec![found.map_or(Variant::Null, Variant::UInt)])
}

fn registration_match(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let procedure = match want_str(args, 0) {
        Ok(procedure) => procedure,
        Err(outcome) => return outcome,
    };
    let found = ctx.dealer.match_best(&Uri::new(procedure));
    MetaOutcome::reply_with(vec![found.map_or(Variant::Null, Variant::UInt)])
}

fn registration_callees(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let id = match want_u64(args, 0) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match ctx.dealer.details(id) {
        Some(details) => {
            MetaOutcome::reply_with(vec![details.callees.into_iter().map(Variant::UInt).collect()])
        }
        None => MetaOutcome::error(WampError::NoSuchRegistration),
    }
}

fn registration_count_callees(ctx: &MetaContext<'_>, args: &[Variant]) -> MetaOutcome {
    let id = match want_u64(args, 0) {
        Ok(id) => id,
        Err(outcome) => return outcome,
    };
    match ctx.dealer.details(id) {
        Some(details) => MetaOutcome::reply_with(vec![Variant::UInt(details.callees.len() as u64)]),
        None => MetaOutcome::error(WampError::NoSuchRegistration),
    }
}
