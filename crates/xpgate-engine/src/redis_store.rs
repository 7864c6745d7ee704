//! Redis implementation of [`KeyValueStore`].
//!
//! Counters are kept as integers in units of 1/10 000 so the
//! check-and-increment can run as one Lua script. Amounts are rounded up
//! and caps rounded down on the way in.

#![cfg(feature = "redis-store")]

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StoreError;
use crate::ledger::Reservation;
use crate::store::KeyValueStore;

const COUNTER_SCALE: u32 = 4;

const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

const INCREMENT_WITHIN: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
local cap = tonumber(ARGV[2])
if amount < 0 or current + amount > cap then
  return {0, current}
end
local next = redis.call('INCRBY', KEYS[1], amount)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return {1, next}
";

pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    compare_and_delete: Script,
    increment_within: Script,
}

impl RedisStore {
    /// Parses the URL. The connection is opened lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the URL is malformed.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            increment_within: Script::new(INCREMENT_WITHIN),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the cached connection after an I/O failure so the next call
    /// reconnects.
    async fn on_error(&self, err: RedisError) -> StoreError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            warn!(error = %err, "redis connection lost");
            *self.connection.lock().await = None;
        }
        unavailable(err)
    }
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn to_units(key: &str, value: Decimal, strategy: RoundingStrategy) -> Result<i64, StoreError> {
    value
        .checked_mul(Decimal::from(10_i64.pow(COUNTER_SCALE)))
        .map(|v| v.round_dp_with_strategy(0, strategy))
        .and_then(|v| v.to_i64())
        .ok_or_else(|| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("{value} does not fit a counter"),
        })
}

fn from_units(units: i64) -> Decimal {
    Decimal::new(units, COUNTER_SCALE).normalize()
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        match redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
        {
            Ok(value) => Ok(value),
            Err(err) => Err(self.on_error(err).await),
        }
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        match redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => Err(self.on_error(err).await),
        }
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        match redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, Option<String>>(&mut conn)
            .await
        {
            Ok(reply) => Ok(reply.is_some()),
            Err(err) => Err(self.on_error(err).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        match redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => Err(self.on_error(err).await),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        match self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async::<_, i64>(&mut conn)
            .await
        {
            Ok(deleted) => Ok(deleted > 0),
            Err(err) => Err(self.on_error(err).await),
        }
    }

    async fn increment_within(
        &self,
        key: &str,
        amount: Decimal,
        cap: Decimal,
        ttl: Duration,
    ) -> Result<Reservation, StoreError> {
        let amount = to_units(key, amount, RoundingStrategy::AwayFromZero)?;
        let cap = to_units(key, cap, RoundingStrategy::ToZero)?;
        let mut conn = self.connection().await?;
        match self
            .increment_within
            .key(key)
            .arg(amount)
            .arg(cap)
            .arg(ttl_millis(ttl))
            .invoke_async::<_, (i64, i64)>(&mut conn)
            .await
        {
            Ok((accepted, total)) => Ok(Reservation {
                accepted: accepted == 1,
                new_total: from_units(total),
            }),
            Err(err) => Err(self.on_error(err).await),
        }
    }

    async fn counter(&self, key: &str) -> Result<Decimal, StoreError> {
        match self.get(key).await? {
            Some(raw) => raw
                .parse::<i64>()
                .map(from_units)
                .map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(Decimal::ZERO),
        }
    }
}
