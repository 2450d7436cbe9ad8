//! Events surfaced to subscribers of a session.

use std::sync::{Arc, Mutex, MutexGuard};

use nexus_common::{Did, IceCandidate, Location, PeerMessage, SessionDescription, SignalMessage};
use tokio::sync::mpsc;

/// Receiving half of a subscription. Yields `None` once the session is gone.
pub type EventStream = mpsc::UnboundedReceiver<SessionEvent>;

/// Emitted when a nearby peer corroborates an inbound emergency.
#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyValidation {
    /// Peer the emergency arrived from.
    pub peer_id: String,
    pub message: PeerMessage,
    pub validation: bool,
}

/// Offer to be relayed to `remote_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferSignal {
    pub offer: SessionDescription,
    pub remote_id: String,
    /// Local DID, so the remote learns which key signs our messages.
    pub did: Did,
}

/// Answer to be relayed back to `remote_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerSignal {
    pub answer: SessionDescription,
    pub remote_id: String,
    pub did: Did,
}

/// Local ICE candidate to be relayed to `remote_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSignal {
    pub candidate: IceCandidate,
    pub remote_id: String,
    pub location: Option<Location>,
}

/// Everything a session reports to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(PeerMessage),
    PeerConnected(String),
    PeerDisconnected(String),
    EmergencyValidation(EmergencyValidation),
    Offer(OfferSignal),
    Answer(AnswerSignal),
    IceCandidate(CandidateSignal),
    Disconnected,
}

impl SessionEvent {
    /// Wrap a negotiation event in the relay envelope, addressed from
    /// `local_id`. Other events yield `None`.
    pub fn to_signal(&self, local_id: &str) -> Option<SignalMessage> {
        match self {
            SessionEvent::Offer(offer) => Some(SignalMessage::OFFER {
                from: local_id.to_string(),
                target: offer.remote_id.clone(),
                sdp: offer.offer.clone(),
                did: offer.did.clone(),
            }),
            SessionEvent::Answer(answer) => Some(SignalMessage::ANSWER {
                from: local_id.to_string(),
                target: answer.remote_id.clone(),
                sdp: answer.answer.clone(),
                did: answer.did.clone(),
            }),
            SessionEvent::IceCandidate(candidate) => Some(SignalMessage::CANDIDATE {
                from: local_id.to_string(),
                target: candidate.remote_id.clone(),
                candidate: candidate.candidate.clone(),
                location: candidate.location,
            }),
            _ => None,
        }
    }
}

/// Fan-out of session events to every live subscriber.
///
/// Each subscriber owns an unbounded queue, so a reader that falls behind
/// still sees every event in emission order.
#[derive(Clone, Default)]
pub(crate) struct EventHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>>,
}

impl EventHub {
    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Queue `event` for every subscriber, forgetting the ones that hung up.
    pub(crate) fn emit(&self, event: SessionEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<SessionEvent>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_sees_every_event() {
        let hub = EventHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        for i in 0..1000 {
            hub.emit(SessionEvent::PeerConnected(format!("peer-{i}")));
        }

        for rx in [&mut first, &mut second] {
            for i in 0..1000 {
                assert_eq!(
                    rx.try_recv().unwrap(),
                    SessionEvent::PeerConnected(format!("peer-{i}"))
                );
            }
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let hub = EventHub::default();
        let mut kept = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);

        hub.emit(SessionEvent::Disconnected);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), SessionEvent::Disconnected);
    }
}
