//! Envelope routing: decides who hears about each inbound message.
//!
//! The router never touches sockets. It updates auth state in the
//! [`Registry`] and returns [`Delivery`] values for the hub to send.

use super::registry::{ConnectionId, Registry};
use crate::auth::{AuthBackend, AuthRateLimiter};
use crate::config::IdentityBinding;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wschat_core::{Envelope, ServerMessage};

/// A message bound for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub message: ServerMessage,
}

impl Delivery {
    fn new(to: ConnectionId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

pub struct Router {
    binding: IdentityBinding,
    backend: Arc<dyn AuthBackend>,
    limiter: AuthRateLimiter,
}

impl Router {
    pub fn new(binding: IdentityBinding, backend: Arc<dyn AuthBackend>, limiter: AuthRateLimiter) -> Self {
        Self {
            binding,
            backend,
            limiter,
        }
    }

    /// First message a connection receives after registration.
    pub fn greeting(&self, id: ConnectionId) -> Delivery {
        Delivery::new(
            id,
            ServerMessage::AuthRequired {
                connection_id: id.to_string(),
            },
        )
    }

    /// Route one envelope that arrived on connection `from`.
    ///
    /// Replies always go to `from`; the envelope may act on another
    /// connection under [`IdentityBinding::Lenient`].
    pub fn route(&mut self, registry: &mut Registry, from: ConnectionId, envelope: Envelope) -> Vec<Delivery> {
        if !registry.contains(from) {
            debug!(conn = from, "dropping envelope from unregistered connection");
            return Vec::new();
        }
        let subject = self.subject(registry, from, envelope.connection_id());
        debug!(conn = from, subject, kind = envelope.kind(), "routing envelope");

        match envelope {
            Envelope::Auth { user_id, token, .. } => {
                self.handle_auth(registry, from, subject, &user_id, token.as_deref())
            }
            Envelope::ToPerson {
                to_user_id,
                chat_message,
                ..
            } => handle_to_person(registry, from, subject, to_user_id, chat_message),
            Envelope::Generic { chat_message, .. } => {
                match registry.get(subject).and_then(|s| s.user_id()) {
                    Some(_) => vec![Delivery::new(
                        from,
                        ServerMessage::Ack {
                            chat_message: chat_message.unwrap_or_default(),
                        },
                    )],
                    None => vec![auth_required(from, subject)],
                }
            }
        }
    }

    /// Periodic housekeeping.
    pub fn gc(&mut self) {
        self.limiter.gc();
    }

    /// The connection an envelope acts on.
    fn subject(&self, registry: &Registry, from: ConnectionId, claimed: Option<&str>) -> ConnectionId {
        let Some(claimed) = claimed else {
            return from;
        };
        let parsed = claimed.trim().parse::<ConnectionId>().ok();
        if parsed == Some(from) {
            return from;
        }

        match self.binding {
            IdentityBinding::Lenient => match parsed {
                Some(id) if registry.contains(id) => id,
                _ => from,
            },
            IdentityBinding::Strict => {
                warn!(conn = from, claimed = %claimed, "ignoring connectionId claim for another connection");
                from
            }
        }
    }

    fn handle_auth(
        &mut self,
        registry: &mut Registry,
        from: ConnectionId,
        subject: ConnectionId,
        user_id: &str,
        token: Option<&str>,
    ) -> Vec<Delivery> {
        let Some(ip) = registry.get(from).map(|s| s.remote_addr.ip()) else {
            return Vec::new();
        };

        if !self.limiter.check_and_record(ip) {
            warn!(conn = from, %ip, "auth rate limited");
            return vec![auth_failed(from, subject, "rate limited: too many auth attempts")];
        }

        if let Err(e) = self.backend.verify(user_id, token) {
            warn!(conn = from, user = %user_id, backend = self.backend.name(), error = %e, "auth rejected");
            return vec![auth_failed(from, subject, &e.to_string())];
        }

        match registry.authenticate(subject, user_id) {
            Ok(outcome) => {
                debug!(conn = from, subject, ?outcome, "auth accepted");
                Vec::new()
            }
            Err(e) => {
                warn!(conn = from, subject, error = %e, "auth could not be applied");
                vec![auth_failed(from, subject, &e.to_string())]
            }
        }
    }
}

fn handle_to_person(
    registry: &Registry,
    from: ConnectionId,
    subject: ConnectionId,
    to_user_id: String,
    chat_message: String,
) -> Vec<Delivery> {
    let Some(from_user_id) = registry.get(subject).and_then(|s| s.user_id()) else {
        return vec![auth_required(from, subject)];
    };

    let Some(recipient) = registry.lookup_user(&to_user_id) else {
        info!(conn = from, to = %to_user_id, "recipient not online");
        return vec![Delivery::new(from, ServerMessage::NotOnline { to_user_id })];
    };

    let delivered = ServerMessage::Delivered {
        chat_message,
        from_user_id: from_user_id.to_string(),
        to_user_id,
    };
    if recipient.id == from {
        return vec![Delivery::new(from, delivered)];
    }
    vec![
        Delivery::new(recipient.id, delivered.clone()),
        Delivery::new(from, delivered),
    ]
}

fn auth_required(to: ConnectionId, subject: ConnectionId) -> Delivery {
    Delivery::new(
        to,
        ServerMessage::AuthRequired {
            connection_id: subject.to_string(),
        },
    )
}

fn auth_failed(to: ConnectionId, subject: ConnectionId, reason: &str) -> Delivery {
    Delivery::new(
        to,
        ServerMessage::AuthFailed {
            connection_id: subject.to_string(),
            reason: reason.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TrustBackend;
    use crate::relay::registry::{AuthState, ConnCommand, Session};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;
    use wschat_core::ChatError;

    struct DenyAll;

    impl AuthBackend for DenyAll {
        fn verify(&self, _user_id: &str, _token: Option<&str>) -> wschat_core::ChatResult<()> {
            Err(ChatError::Auth("nope".into()))
        }

        fn name(&self) -> &'static str {
            "deny"
        }
    }

    struct Fixture {
        registry: Registry,
        router: Router,
        _rxs: Vec<mpsc::Receiver<ConnCommand>>,
    }

    impl Fixture {
        fn new(binding: IdentityBinding, ids: &[ConnectionId]) -> Self {
            Self::with(binding, Arc::new(TrustBackend), AuthRateLimiter::per_minute(0), ids)
        }

        fn with(
            binding: IdentityBinding,
            backend: Arc<dyn AuthBackend>,
            limiter: AuthRateLimiter,
            ids: &[ConnectionId],
        ) -> Self {
            let mut registry = Registry::new();
            let mut rxs = Vec::new();
            for &id in ids {
                let (tx, rx) = mpsc::channel(8);
                let addr: SocketAddr = format!("10.0.0.{id}:4000").parse().unwrap();
                registry.register(Session::new(id, addr, tx)).unwrap();
                rxs.push(rx);
            }
            Self {
                registry,
                router: Router::new(binding, backend, limiter),
                _rxs: rxs,
            }
        }

        fn send(&mut self, from: ConnectionId, text: &str) -> Vec<Delivery> {
            self.router
                .route(&mut self.registry, from, Envelope::parse(text))
        }

        fn auth(&mut self, from: ConnectionId, user: &str) -> Vec<Delivery> {
            self.send(from, &format!(r#"{{"type":"auth","userId":"{user}"}}"#))
        }
    }

    #[test]
    fn greeting_names_connection() {
        let fx = Fixture::new(IdentityBinding::Lenient, &[4]);
        assert_eq!(
            fx.router.greeting(4),
            Delivery::new(4, ServerMessage::AuthRequired { connection_id: "4".into() })
        );
    }

    #[test]
    fn auth_is_silent_on_success() {
        let mut fx = Fixture::new(IdentityBinding::Lenient, &[1]);
        assert!(fx.auth(1, "alice").is_empty());
        assert_eq!(
            fx.registry.get(1).unwrap().auth_state(),
            &AuthState::Authenticated("alice".into())
        );
    }

    #[test]
    fn generic_requires_auth_then_acks() {
        let mut fx = Fixture::new(IdentityBinding::Lenient, &[1]);
        assert_eq!(
            fx.send(1, r#"{"type":"message","chatMessage":"hi"}"#),
            vec![Delivery::new(1, ServerMessage::AuthRequired { connection_id: "1".into() })]
        );

        fx.auth(1, "alice");
        assert_eq!(
            fx.send(1, r#"{"type":"message","chatMessage":"hi"}"#),
            vec![Delivery::new(1, ServerMessage::Ack { chat_message: "hi".into() })]
        );
        assert_eq!(
            fx.send(1, "plain text"),
            vec![Delivery::new(1, ServerMessage::Ack { chat_message: "plain text".into() })]
        );
    }

    #[test]
    fn to_person_delivers_to_both() {
        let mut fx = Fixture::new(IdentityBinding::Lenient, &[1, 2]);
        fx.auth(1, "alice");
        fx.auth(2, "bob");

        let delivered = ServerMessage::Delivered {
            chat_message: "hello".into(),
            from_user_id: "alice".into(),
            to_user_id: "bob".into(),
        };
        assert_eq!(
            fx.send(1, r#"{"type":"to-person","toUserId":"bob","chatMessage":"hello"}"#),
            vec![Delivery::new(2, delivered.clone()), Delivery::new(1, delivered)]
        );
    }

    #[test]
    fn to_person_to_self_is_sent_once() {
        let mut fx = Fixture::new(IdentityBinding::Lenient, &[1]);
        fx.auth(1, "alice");
        let out = fx.send(1, r#"{"type":"to-person","toUserId":"alice","chatMessage":"memo"}"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, 1);
    }

    #[test]
    fn to_person_unknown_recipient() {
        let mut fx = Fixture::new(IdentityBinding::Lenient, &[1]);
        fx.auth(1, "alice");
        assert_eq!(
            fx.send(1, r#"{"type":"to-person","toUserId":"ghost","chatMessage":"x"}"#),
            vec![Delivery::new(1, ServerMessage::NotOnline { to_user_id: "ghost".into() })]
        );
    }

    #[test]
    fn to_person_requires_auth() {
        let mut fx = Fixture::new(IdentityBinding::Lenient, &[1, 2]);
        fx.auth(2, "bob");
        assert_eq!(
            fx.send(1, r#"{"type":"to-person","toUserId":"bob","chatMessage":"x"}"#),
            vec![Delivery::new(1, ServerMessage::AuthRequired { connection_id: "1".into() })]
        );
    }

    #[test]
    fn lenient_honors_claimed_connection() {
        let mut fx = Fixture::new(IdentityBinding::Lenient, &[1, 2]);
        assert!(fx
            .send(1, r#"{"connectionId":"2","type":"auth","userId":"bob"}"#)
            .is_empty());
        assert!(!fx.registry.get(1).unwrap().is_authenticated());
        assert_eq!(fx.registry.lookup_user("bob").unwrap().id, 2);

        // An unknown claim falls back to the physical connection.
        fx.send(1, r#"{"connectionId":"99","type":"auth","userId":"carol"}"#);
        assert_eq!(fx.registry.lookup_user("carol").unwrap().id, 1);
    }

    #[test]
    fn strict_ignores_claimed_connection() {
        let mut fx = Fixture::new(IdentityBinding::Strict, &[1, 2]);
        fx.send(1, r#"{"connectionId":"2","type":"auth","userId":"bob"}"#);
        assert_eq!(fx.registry.lookup_user("bob").unwrap().id, 1);
        assert!(!fx.registry.get(2).unwrap().is_authenticated());
    }

    #[test]
    fn rejected_auth_reports_reason() {
        let mut fx = Fixture::with(
            IdentityBinding::Lenient,
            Arc::new(DenyAll),
            AuthRateLimiter::per_minute(0),
            &[1],
        );
        let out = fx.auth(1, "alice");
        assert_eq!(out.len(), 1);
        match &out[0].message {
            ServerMessage::AuthFailed { connection_id, reason } => {
                assert_eq!(connection_id, "1");
                assert!(reason.contains("nope"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!fx.registry.get(1).unwrap().is_authenticated());
    }

    #[test]
    fn auth_attempts_are_rate_limited() {
        let mut fx = Fixture::with(
            IdentityBinding::Lenient,
            Arc::new(TrustBackend),
            AuthRateLimiter::per_minute(2),
            &[1],
        );
        assert!(fx.auth(1, "a").is_empty());
        assert!(fx.auth(1, "b").is_empty());
        let out = fx.auth(1, "c");
        assert!(matches!(out[0].message, ServerMessage::AuthFailed { .. }));
        assert_eq!(fx.registry.get(1).unwrap().user_id(), Some("b"));
    }

    #[test]
    fn unregistered_sender_is_ignored() {
        let mut fx = Fixture::new(IdentityBinding::Lenient, &[1]);
        assert!(fx.auth(7, "alice").is_empty());
        assert!(fx.registry.lookup_user("alice").is_none());
    }
}
