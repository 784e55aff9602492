//! Call arbitration: a single process-wide call slot.

use uuid::Uuid;

use crate::connection::ConnectionId;
use crate::contact::Contact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Offer received, caller told we are ringing, waiting for accept/decline.
    Ringing,
    /// Answer sent; media layer owns the call from here.
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: Uuid,
    pub contact: Contact,
    /// Connection the caller is waiting on; all call signaling goes over it.
    pub connection: ConnectionId,
    pub offer: String,
    pub answer: Option<String>,
    pub state: CallState,
}

/// Holds at most one call session.
#[derive(Debug, Default)]
pub struct CallArbiter {
    current: Option<CallSession>,
}

impl CallArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&CallSession> {
        self.current.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Ringing session, if any.
    pub fn pending(&self) -> Option<&CallSession> {
        self.current.as_ref().filter(|s| s.state == CallState::Ringing)
    }

    /// Start ringing for an incoming offer. Fails with `Busy` while another session exists.
    pub fn start_incoming(
        &mut self,
        contact: Contact,
        connection: ConnectionId,
        offer: String,
    ) -> Result<&CallSession, CallError> {
        if let Some(active) = &self.current {
            return Err(CallError::Busy { active: active.id });
        }
        Ok(self.current.insert(CallSession {
            id: Uuid::new_v4(),
            contact,
            connection,
            offer,
            answer: None,
            state: CallState::Ringing,
        }))
    }

    /// Ringing → Accepted for session `id`.
    pub fn accept(&mut self, id: Uuid, answer: String) -> Result<&CallSession, CallError> {
        match self.current.as_mut() {
            None => Err(CallError::NoCall),
            Some(s) if s.id != id => Err(CallError::Stale),
            Some(s) if s.state != CallState::Ringing => Err(CallError::NotRinging),
            Some(s) => {
                s.answer = Some(answer);
                s.state = CallState::Accepted;
                Ok(s)
            }
        }
    }

    /// Release the session if it is still ringing.
    pub fn decline(&mut self) -> Option<CallSession> {
        if self.pending().is_some() {
            self.current.take()
        } else {
            None
        }
    }

    /// Release the session whatever its state.
    pub fn hangup(&mut self) -> Option<CallSession> {
        self.current.take()
    }

    /// Release the session if it runs over `connection`.
    pub fn release_connection(&mut self, connection: ConnectionId) -> Option<CallSession> {
        if self.current.as_ref().map(|s| s.connection) == Some(connection) {
            self.current.take()
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("another call is active ({active})")]
    Busy { active: Uuid },
    #[error("no call in progress")]
    NoCall,
    #[error("call is not ringing")]
    NotRinging,
    #[error("call was replaced or ended")]
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn caller() -> Contact {
        Contact::new("caller", *Keypair::generate().public_key(), vec![])
    }

    #[test]
    fn single_slot() {
        let mut arbiter = CallArbiter::new();
        let first = arbiter
            .start_incoming(caller(), ConnectionId::new(1), "offer-1".into())
            .unwrap()
            .id;
        let err = arbiter
            .start_incoming(caller(), ConnectionId::new(2), "offer-2".into())
            .unwrap_err();
        assert!(matches!(err, CallError::Busy { active } if active == first));
        assert_eq!(arbiter.current().unwrap().offer, "offer-1");
    }

    #[test]
    fn accept_then_decline_is_noop() {
        let mut arbiter = CallArbiter::new();
        let id = arbiter
            .start_incoming(caller(), ConnectionId::new(1), "offer".into())
            .unwrap()
            .id;
        let session = arbiter.accept(id, "answer".into()).unwrap();
        assert_eq!(session.state, CallState::Accepted);
        assert_eq!(session.answer.as_deref(), Some("answer"));
        assert!(arbiter.decline().is_none());
        assert!(matches!(
            arbiter.accept(id, "again".into()),
            Err(CallError::NotRinging)
        ));
        assert!(arbiter.hangup().is_some());
        assert!(!arbiter.is_busy());
    }

    #[test]
    fn accept_checks_session_id() {
        let mut arbiter = CallArbiter::new();
        assert!(matches!(
            arbiter.accept(Uuid::new_v4(), "a".into()),
            Err(CallError::NoCall)
        ));
        arbiter
            .start_incoming(caller(), ConnectionId::new(1), "offer".into())
            .unwrap();
        assert!(matches!(
            arbiter.accept(Uuid::new_v4(), "a".into()),
            Err(CallError::Stale)
        ));
    }

    #[test]
    fn release_only_matching_connection() {
        let mut arbiter = CallArbiter::new();
        arbiter
            .start_incoming(caller(), ConnectionId::new(7), "offer".into())
            .unwrap();
        assert!(arbiter.release_connection(ConnectionId::new(8)).is_none());
        assert!(arbiter.is_busy());
        assert!(arbiter.release_connection(ConnectionId::new(7)).is_some());
        assert!(!arbiter.is_busy());
    }
}
