//! Subscription session state machine.
//!
//! The MQTT event loop is translated into [`SessionEvent`]s; the session
//! decides what the transport task should do next. Keeping this free of any
//! network types lets the reconnect and backoff rules be tested without a
//! broker.
//!
//! ```text
//! Disconnected --attempt--> Connecting --connack--> Connecting (subscribe sent)
//! Connecting --suback--> Subscribed --message--> Draining
//! any --connection lost--> Disconnected (backoff)
//! ```

use std::fmt;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    Draining,
}

impl SessionState {
    /// True once the subscription is acknowledged on a live connection.
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Subscribed | SessionState::Draining)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Subscribed => "subscribed",
            SessionState::Draining => "draining",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The transport is about to (re)open the connection.
    ConnectAttempt,
    Connected { session_present: bool },
    SubscribeAcked,
    Message,
    ConnectionLost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Subscribe,
    Deliver,
    Backoff(Duration),
}

/// Exponential reconnect delay: `initial`, doubled per failure, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            failures: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.failures = self.failures.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    backoff: Backoff,
}

impl Session {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: SessionState::Disconnected,
            backoff,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&mut self, event: SessionEvent) -> Option<SessionAction> {
        let (next, action) = match (self.state, event) {
            (_, SessionEvent::ConnectionLost(reason)) => {
                let delay = self.backoff.next_delay();
                info!("MQTT connection lost ({}), retrying in {:?}", reason, delay);
                (SessionState::Disconnected, Some(SessionAction::Backoff(delay)))
            }
            (_, SessionEvent::ConnectAttempt) => (SessionState::Connecting, None),
            (_, SessionEvent::Connected { session_present }) => {
                info!("MQTT connected (session present: {})", session_present);
                (SessionState::Connecting, Some(SessionAction::Subscribe))
            }
            (SessionState::Connecting, SessionEvent::SubscribeAcked) => {
                self.backoff.reset();
                (SessionState::Subscribed, None)
            }
            (state, SessionEvent::SubscribeAcked) => (state, None),
            (SessionState::Subscribed, SessionEvent::Message) => {
                (SessionState::Draining, Some(SessionAction::Deliver))
            }
            // Persistent sessions may redeliver before the subscription is
            // re-acknowledged; those messages are still delivered.
            (state, SessionEvent::Message) => (state, Some(SessionAction::Deliver)),
        };

        if next != self.state {
            info!("MQTT session {} -> {}", self.state, next);
            self.state = next;
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
        ))
    }

    #[test]
    fn test_happy_path_reaches_draining() {
        let mut session = session();
        assert_eq!(session.state(), SessionState::Disconnected);

        assert_eq!(session.handle(SessionEvent::ConnectAttempt), None);
        assert_eq!(session.state(), SessionState::Connecting);

        assert_eq!(
            session.handle(SessionEvent::Connected {
                session_present: false
            }),
            Some(SessionAction::Subscribe)
        );
        assert_eq!(session.handle(SessionEvent::SubscribeAcked), None);
        assert_eq!(session.state(), SessionState::Subscribed);

        assert_eq!(
            session.handle(SessionEvent::Message),
            Some(SessionAction::Deliver)
        );
        assert_eq!(session.state(), SessionState::Draining);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut session = session();
        let mut delays = Vec::new();
        for _ in 0..6 {
            session.handle(SessionEvent::ConnectAttempt);
            match session.handle(SessionEvent::ConnectionLost("refused".into())) {
                Some(SessionAction::Backoff(d)) => delays.push(d.as_millis()),
                other => panic!("expected backoff, got {:?}", other),
            }
        }

        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_resubscribe_after_reconnect_resets_backoff() {
        let mut session = session();
        session.handle(SessionEvent::ConnectionLost("dns".into()));
        session.handle(SessionEvent::ConnectionLost("dns".into()));

        session.handle(SessionEvent::ConnectAttempt);
        assert_eq!(
            session.handle(SessionEvent::Connected {
                session_present: true
            }),
            Some(SessionAction::Subscribe)
        );
        session.handle(SessionEvent::SubscribeAcked);

        assert_eq!(
            session.handle(SessionEvent::ConnectionLost("reset".into())),
            Some(SessionAction::Backoff(Duration::from_millis(100)))
        );
    }

    #[test]
    fn test_redelivered_messages_before_suback_are_delivered() {
        let mut session = session();
        session.handle(SessionEvent::ConnectAttempt);
        session.handle(SessionEvent::Connected {
            session_present: true,
        });

        assert_eq!(
            session.handle(SessionEvent::Message),
            Some(SessionAction::Deliver)
        );
        assert_eq!(session.state(), SessionState::Connecting);
    }
}
