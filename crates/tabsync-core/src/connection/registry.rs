//! Subscription bookkeeping. Many subscriptions share one channel binding;
//! the binding exists while at least one subscription references it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tabsync_protocol::RealtimeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;
pub type EventFilter = Arc<dyn Fn(&RealtimeEvent) -> bool + Send + Sync>;

struct Subscription {
    channel: String,
    handler: EventHandler,
    filter: Option<EventFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    pub channel: String,
    pub reference_count: usize,
    /// Confirmed bound on the current transport connection.
    pub bound: bool,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    bindings: BTreeMap<String, ChannelBinding>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. The flag is true when it created the binding.
    pub fn add(
        &mut self,
        channel: &str,
        handler: EventHandler,
        filter: Option<EventFilter>,
    ) -> (SubscriptionId, bool) {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscriptions.insert(
            id,
            Subscription {
                channel: channel.to_string(),
                handler,
                filter,
            },
        );
        let binding = self
            .bindings
            .entry(channel.to_string())
            .or_insert_with(|| ChannelBinding {
                channel: channel.to_string(),
                reference_count: 0,
                bound: false,
            });
        binding.reference_count += 1;
        (id, binding.reference_count == 1)
    }

    /// Remove a subscription. Returns its channel and whether the binding
    /// went away with it.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<(String, bool)> {
        let subscription = self.subscriptions.remove(&id)?;
        let channel = subscription.channel;
        let Some(binding) = self.bindings.get_mut(&channel) else {
            return Some((channel, false));
        };
        binding.reference_count = binding.reference_count.saturating_sub(1);
        let last = binding.reference_count == 0;
        if last {
            self.bindings.remove(&channel);
        }
        Some((channel, last))
    }

    /// Handlers interested in `event`, in subscription order.
    pub fn handlers_for(&self, event: &RealtimeEvent) -> Vec<EventHandler> {
        let mut matching: Vec<(&SubscriptionId, &Subscription)> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.channel == event.channel)
            .filter(|(_, sub)| sub.filter.as_ref().is_none_or(|accept| accept(event)))
            .collect();
        matching.sort_by_key(|(id, _)| **id);
        matching.into_iter().map(|(_, sub)| sub.handler.clone()).collect()
    }

    pub fn binding(&self, channel: &str) -> Option<&ChannelBinding> {
        self.bindings.get(channel)
    }

    pub fn bindings(&self) -> Vec<ChannelBinding> {
        self.bindings.values().cloned().collect()
    }

    pub fn channels(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    pub fn contains_channel(&self, channel: &str) -> bool {
        self.bindings.contains_key(channel)
    }

    pub fn mark_bound(&mut self, channel: &str) -> bool {
        match self.bindings.get_mut(channel) {
            Some(binding) => {
                binding.bound = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_unbound(&mut self, channel: &str) {
        if let Some(binding) = self.bindings.get_mut(channel) {
            binding.bound = false;
        }
    }

    pub fn mark_all_unbound(&mut self) {
        for binding in self.bindings.values_mut() {
            binding.bound = false;
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
