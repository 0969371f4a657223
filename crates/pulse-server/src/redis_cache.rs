//! Redis-backed shared membership tier.
//!
//! Sets live under the same keys the local tier uses, each with a companion
//! `<key>:v` counter that every delete increments. Invalidations travel over
//! one pub/sub channel; a background task forwards them onto the local
//! broadcast bus and resubscribes when the subscription drops.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::membership::{CacheError, CacheSignal, Invalidation, SharedCache};

const INVALIDATION_CHANNEL: &str = "pulse:membership:invalidations";
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// KEYS[1] set, KEYS[2] version counter.
/// ARGV[1] version seen before loading, ARGV[2] TTL in seconds, ARGV[3..] members.
const PUT_IF_UNCHANGED: &str = r"
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if current ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('DEL', KEYS[1])
for i = 3, #ARGV, 1000 do
  redis.call('SADD', KEYS[1], unpack(ARGV, i, math.min(i + 999, #ARGV)))
end
if #ARGV > 2 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 1
";

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

pub struct RedisSharedCache {
    conn: ConnectionManager,
    put_script: Script,
    bus: broadcast::Sender<CacheSignal>,
}

impl RedisSharedCache {
    /// Connect and start forwarding invalidations from the channel.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let (bus, _) = broadcast::channel(1024);

        tokio::spawn(forward_invalidations(client, bus.clone()));
        info!("Connected to Redis shared cache");

        Ok(Self {
            conn,
            put_script: Script::new(PUT_IF_UNCHANGED),
            bus,
        })
    }
}

fn version_key(key: &str) -> String {
    format!("{key}:v")
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn get_set(&self, key: &str) -> Result<Option<Vec<String>>, CacheError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        // Redis has no empty sets; an empty answer is a miss.
        Ok(if members.is_empty() { None } else { Some(members) })
    }

    async fn version(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let version: Option<u64> = conn.get(version_key(key)).await?;
        Ok(version.unwrap_or(0))
    }

    async fn put_set_if_unchanged(
        &self,
        key: &str,
        members: Vec<String>,
        ttl: Duration,
        seen_version: u64,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.put_script.key(key);
        invocation
            .key(version_key(key))
            .arg(seen_version)
            .arg(ttl.as_secs().max(1));
        for member in members {
            invocation.arg(member);
        }
        let stored: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(stored == 1)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(keys).ignore();
        for key in keys {
            pipe.incr(version_key(key), 1).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, event: Invalidation) -> Result<(), CacheError> {
        let payload =
            serde_json::to_string(&event).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(INVALIDATION_CHANNEL, payload).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheSignal> {
        self.bus.subscribe()
    }
}

/// Runs for the life of the process. Every (re)subscription is followed by
/// a [`CacheSignal::Resync`], since events published while unsubscribed are
/// gone.
async fn forward_invalidations(client: Client, bus: broadcast::Sender<CacheSignal>) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => match pubsub.subscribe(INVALIDATION_CHANNEL).await {
                Ok(()) => {
                    debug!(channel = INVALIDATION_CHANNEL, "Subscribed to invalidations");
                    let _ = bus.send(CacheSignal::Resync);
                    let mut messages = std::pin::pin!(pubsub.on_message());
                    while let Some(msg) = messages.next().await {
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "Unreadable invalidation payload");
                                continue;
                            }
                        };
                        if let Some(event) = decode_invalidation(&payload) {
                            let _ = bus.send(CacheSignal::Invalidated(event));
                        }
                    }
                    warn!("Invalidation subscription closed, resubscribing");
                }
                Err(e) => warn!(error = %e, "Invalidation subscribe failed"),
            },
            Err(e) => warn!(error = %e, "Redis pub/sub connection failed"),
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

fn decode_invalidation(payload: &str) -> Option<Invalidation> {
    match serde_json::from_str(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Malformed invalidation event");
            None
        }
    }
}
