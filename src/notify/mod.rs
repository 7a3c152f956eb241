//! Notification channels and SSE fan-out.
//!
//! Channels are process-local and lost on restart. Each channel holds a set
//! of subscription filters keyed by the canonical selector token (making
//! subscribe idempotent) and a set of attached SSE streams. A single
//! upstream listener (see `listener`) pushes every newly appended event into
//! each attached stream's mailbox; the stream side evaluates its channel's
//! filters and emits one SSE message per matching event.
//!
//! Streams are held through their mailbox senders. A dropped client closes
//! its stream, whose drop guard deregisters the sender; senders that fail
//! during a push are pruned, so stale connections cannot accumulate.

pub mod jsonpath;
pub mod listener;
pub mod matcher;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ledger::event_id::LedgerId;
use crate::ledger::events::PersistedEvent;
use crate::selector::{codec, Selector};
use crate::Error;
use matcher::Matcher;

/// A selector registered to a channel.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    /// Canonical selector token; doubles as the idempotency key.
    pub token: String,
    pub selector: Selector,
    matcher: Matcher,
}

struct ChannelState {
    filters: HashMap<String, Subscription>,
    streams: HashMap<u64, mpsc::UnboundedSender<Arc<PersistedEvent>>>,
    next_stream_key: u64,
}

pub struct Channel {
    pub ledger: LedgerId,
    pub id: String,
    state: Mutex<ChannelState>,
}

impl Channel {
    fn new(ledger: LedgerId, id: String) -> Arc<Channel> {
        Arc::new(Channel {
            ledger,
            id,
            state: Mutex::new(ChannelState {
                filters: HashMap::new(),
                streams: HashMap::new(),
                next_stream_key: 0,
            }),
        })
    }

    /// Ids of the subscriptions matching `event`, in subscription order.
    pub fn matched_subscriptions(&self, event: &PersistedEvent) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state
            .filters
            .values()
            .filter(|sub| sub.matcher.matches(event))
            .map(|sub| sub.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Push an event into every attached stream, pruning dead mailboxes.
    fn push(&self, event: &Arc<PersistedEvent>) {
        let mut state = self.state.lock().unwrap();
        state
            .streams
            .retain(|_, sender| sender.send(Arc::clone(event)).is_ok());
    }

    fn attach_stream(self: &Arc<Self>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        let key = state.next_stream_key;
        state.next_stream_key += 1;
        state.streams.insert(key, tx);
        EventStream {
            channel: Arc::clone(self),
            key,
            rx,
        }
    }

    fn detach_stream(&self, key: u64) {
        // Idempotent; the drop guard and close may both call this.
        self.state.lock().unwrap().streams.remove(&key);
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.streams.clear();
        state.filters.clear();
    }
}

/// An attached SSE stream's consumer half: a push-pull mailbox. A push
/// wakes a waiting consumer or buffers; dropping the consumer deregisters
/// the stream from its channel.
pub struct EventStream {
    channel: Arc<Channel>,
    key: u64,
    rx: mpsc::UnboundedReceiver<Arc<PersistedEvent>>,
}

impl EventStream {
    /// The next pushed event; `None` once the channel has been closed.
    pub async fn recv(&mut self) -> Option<Arc<PersistedEvent>> {
        self.rx.recv().await
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.channel.detach_stream(self.key);
    }
}

/// Process-local registry of all channels.
pub struct Channels {
    channels: DashMap<(u32, String), Arc<Channel>>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Channels {
            channels: DashMap::new(),
        }
    }

    pub fn open(&self, ledger: LedgerId) -> String {
        let id = compact_id();
        self.channels
            .insert((ledger.0, id.clone()), Channel::new(ledger, id.clone()));
        id
    }

    pub fn channel(&self, ledger: LedgerId, channel_id: &str) -> Option<Arc<Channel>> {
        self.channels
            .get(&(ledger.0, channel_id.to_string()))
            .map(|c| Arc::clone(c.value()))
    }

    fn channel_or_404(&self, ledger: LedgerId, channel_id: &str) -> Result<Arc<Channel>, Error> {
        self.channel(ledger, channel_id)
            .ok_or_else(|| Error::NotFound(format!("channel '{channel_id}' not found")))
    }

    /// Register a selector on a channel. Subscribing the same canonical
    /// selector again returns the existing subscription id.
    pub fn subscribe(
        &self,
        ledger: LedgerId,
        channel_id: &str,
        selector: &Selector,
    ) -> Result<String, Error> {
        let channel = self.channel_or_404(ledger, channel_id)?;
        let stored = selector.without_limit().canonical();
        let token = codec::encode(&stored);

        let mut state = channel.state.lock().unwrap();
        if let Some(existing) = state.filters.get(&token) {
            return Ok(existing.id.clone());
        }
        let matcher = Matcher::compile(&stored)?;
        let subscription = Subscription {
            id: compact_id(),
            token: token.clone(),
            selector: stored,
            matcher,
        };
        let id = subscription.id.clone();
        state.filters.insert(token, subscription);
        Ok(id)
    }

    pub fn unsubscribe(
        &self,
        ledger: LedgerId,
        channel_id: &str,
        subscription_id: &str,
    ) -> Result<(), Error> {
        let channel = self.channel_or_404(ledger, channel_id)?;
        let mut state = channel.state.lock().unwrap();
        let token = state
            .filters
            .values()
            .find(|sub| sub.id == subscription_id)
            .map(|sub| sub.token.clone())
            .ok_or_else(|| {
                Error::NotFound(format!("subscription '{subscription_id}' not found"))
            })?;
        state.filters.remove(&token);
        Ok(())
    }

    pub fn subscriptions(
        &self,
        ledger: LedgerId,
        channel_id: &str,
    ) -> Result<Vec<Subscription>, Error> {
        let channel = self.channel_or_404(ledger, channel_id)?;
        let state = channel.state.lock().unwrap();
        let mut subs: Vec<Subscription> = state.filters.values().cloned().collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subs)
    }

    pub fn subscription(
        &self,
        ledger: LedgerId,
        channel_id: &str,
        subscription_id: &str,
    ) -> Result<Subscription, Error> {
        let channel = self.channel_or_404(ledger, channel_id)?;
        let state = channel.state.lock().unwrap();
        state
            .filters
            .values()
            .find(|sub| sub.id == subscription_id)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("subscription '{subscription_id}' not found"))
            })
    }

    /// Attach an SSE stream to a channel. Catch-up replay is not supported,
    /// so a `Last-Event-Id` is rejected.
    pub fn open_event_stream(
        &self,
        ledger: LedgerId,
        channel_id: &str,
        last_event_id: Option<&str>,
    ) -> Result<EventStream, Error> {
        if last_event_id.is_some() {
            return Err(Error::BadInput(
                "Last-Event-Id is not supported; reconnect and fetch missed events via selectors"
                    .to_string(),
            ));
        }
        let channel = self.channel_or_404(ledger, channel_id)?;
        Ok(channel.attach_stream())
    }

    /// Close a channel: detach every stream and forget its subscriptions.
    pub fn close(&self, ledger: LedgerId, channel_id: &str) -> Result<(), Error> {
        let (_, channel) = self
            .channels
            .remove(&(ledger.0, channel_id.to_string()))
            .ok_or_else(|| Error::NotFound(format!("channel '{channel_id}' not found")))?;
        channel.close();
        Ok(())
    }

    /// Number of open channels across all ledgers.
    pub fn count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver a newly appended event to every channel of its ledger.
    pub fn dispatch(&self, ledger: LedgerId, event: Arc<PersistedEvent>) {
        for entry in self.channels.iter() {
            if entry.value().ledger == ledger {
                entry.value().push(&event);
            }
        }
    }
}

fn compact_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event_id::EventId;
    use crate::selector::SelectorInput;
    use serde_json::json;

    const LEDGER: LedgerId = LedgerId(1);

    fn selector(input: serde_json::Value) -> Selector {
        serde_json::from_value::<SelectorInput>(input)
            .unwrap()
            .into_selector()
            .unwrap()
    }

    fn order_event(key: &str) -> Arc<PersistedEvent> {
        Arc::new(PersistedEvent::new(
            EventId::new(10, 1, LEDGER),
            "order-placed".to_string(),
            json!({ "order": [key] }),
            serde_json::Value::Null,
            serde_json::Value::Null,
        ))
    }

    #[test]
    fn test_subscribe_is_idempotent_by_canonical_selector() {
        let channels = Channels::new();
        let ch = channels.open(LEDGER);
        let a = channels
            .subscribe(LEDGER, &ch, &selector(json!({"entities": {"order": ["o-1"]}})))
            .unwrap();
        let b = channels
            .subscribe(LEDGER, &ch, &selector(json!({"entities": {"order": ["o-1"]}})))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(channels.subscriptions(LEDGER, &ch).unwrap().len(), 1);
    }

    #[test]
    fn test_subscribe_strips_limit() {
        let channels = Channels::new();
        let ch = channels.open(LEDGER);
        let a = channels
            .subscribe(
                LEDGER,
                &ch,
                &selector(json!({"entities": {"order": ["o-1"]}, "limit": 5})),
            )
            .unwrap();
        let b = channels
            .subscribe(
                LEDGER,
                &ch,
                &selector(json!({"entities": {"order": ["o-1"]}, "limit": 9})),
            )
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unsubscribe_removes_subscription() {
        let channels = Channels::new();
        let ch = channels.open(LEDGER);
        let sub = channels
            .subscribe(LEDGER, &ch, &selector(json!({"entities": {"order": ["o-1"]}})))
            .unwrap();
        channels.unsubscribe(LEDGER, &ch, &sub).unwrap();
        assert!(channels.subscription(LEDGER, &ch, &sub).is_err());
        assert!(channels.unsubscribe(LEDGER, &ch, &sub).is_err());
    }

    #[test]
    fn test_unknown_channel_is_not_found() {
        let channels = Channels::new();
        assert!(matches!(
            channels.subscribe(LEDGER, "nope", &selector(json!({}))),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_attached_streams() {
        let channels = Channels::new();
        let ch = channels.open(LEDGER);
        let sub = channels
            .subscribe(LEDGER, &ch, &selector(json!({"entities": {"order": ["o-1"]}})))
            .unwrap();
        let mut stream = channels.open_event_stream(LEDGER, &ch, None).unwrap();

        channels.dispatch(LEDGER, order_event("o-1"));
        let event = stream.recv().await.unwrap();
        assert_eq!(stream.channel().matched_subscriptions(&event), vec![sub]);

        // A non-matching event is still pushed but matches no subscription.
        channels.dispatch(LEDGER, order_event("o-9"));
        let event = stream.recv().await.unwrap();
        assert!(stream.channel().matched_subscriptions(&event).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_skips_other_ledgers() {
        let channels = Channels::new();
        let ch = channels.open(LEDGER);
        let mut stream = channels.open_event_stream(LEDGER, &ch, None).unwrap();
        channels.dispatch(LedgerId(2), order_event("o-1"));
        channels.dispatch(LEDGER, order_event("o-1"));
        // Only the same-ledger event arrives.
        let event = stream.recv().await.unwrap();
        assert_eq!(event.event, "order-placed");
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(20),
            stream.recv()
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_dropped_stream_is_pruned() {
        let channels = Channels::new();
        let ch = channels.open(LEDGER);
        let stream = channels.open_event_stream(LEDGER, &ch, None).unwrap();
        drop(stream);
        channels.dispatch(LEDGER, order_event("o-1"));
        let channel = channels.channel(LEDGER, &ch).unwrap();
        assert!(channel.state.lock().unwrap().streams.is_empty());
    }

    #[tokio::test]
    async fn test_close_terminates_streams() {
        let channels = Channels::new();
        let ch = channels.open(LEDGER);
        let mut stream = channels.open_event_stream(LEDGER, &ch, None).unwrap();
        channels.close(LEDGER, &ch).unwrap();
        assert!(stream.recv().await.is_none());
        assert!(channels.channel(LEDGER, &ch).is_none());
    }

    #[test]
    fn test_last_event_id_is_rejected() {
        let channels = Channels::new();
        let ch = channels.open(LEDGER);
        assert!(matches!(
            channels.open_event_stream(LEDGER, &ch, Some("anything")),
            Err(Error::BadInput(_))
        ));
    }
}
