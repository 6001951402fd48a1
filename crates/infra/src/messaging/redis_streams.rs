//! Redis Streams-backed message queue (durable, at-least-once delivery).
//!
//! ## Mapping onto streams
//!
//! - One stream per queue: `annoflow:queue:<name>`
//! - One consumer group (`annoflow`) shared by every worker process; each
//!   process reads as its own named consumer
//! - `receive` first reclaims entries idle longer than the visibility window
//!   (`XAUTOCLAIM`), then reads new entries (`XREADGROUP … >`)
//! - Delivery counts come from the pending entries list (`XPENDING`)
//! - `ack` is `XACK` + `XDEL`
//!
//! Receipt handles are `<entry id>/<delivery count>`. A handle whose delivery
//! count no longer matches the pending entry belongs to an older delivery and
//! is rejected.

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};
use uuid::Uuid;

use annoflow_events::{MessageQueue, QueueError, QueueMessage};

const STREAM_PREFIX: &str = "annoflow:queue:";
const DEFAULT_GROUP: &str = "annoflow";
const BODY_FIELD: &str = "body";

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    name: String,
    stream_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

#[derive(Debug)]
struct StreamEntry {
    id: String,
    body: Option<String>,
}

impl RedisStreamsQueue {
    /// Open the queue `name`, creating its stream and consumer group if needed.
    pub fn open(
        client: Arc<redis::Client>,
        name: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        let queue = Self {
            client,
            stream_key: format!("{STREAM_PREFIX}{name}"),
            name,
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", Uuid::now_v7()),
            visibility_timeout,
        };
        queue.ensure_consumer_group()?;
        Ok(queue)
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Unavailable(format!("redis connection: {e}")))
    }

    /// Ensure the consumer group exists (idempotent).
    fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Unavailable(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn visibility_ms(&self) -> u64 {
        u64::try_from(self.visibility_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Take over entries whose previous delivery outlived the visibility window.
    fn reclaim_expired(&self, conn: &mut redis::Connection, count: usize) -> Result<Vec<StreamEntry>, QueueError> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_ms())
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XAUTOCLAIM failed: {e}")))?;

        // [next-start-id, [entries…], (deleted ids…)]
        match reply {
            redis::Value::Bulk(parts) if parts.len() >= 2 => parse_entries(&parts[1]),
            other => Err(QueueError::Protocol(format!("unexpected XAUTOCLAIM reply: {other:?}"))),
        }
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        count: usize,
        wait: Duration,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count);
        // BLOCK 0 would block forever.
        let block_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        let reply: redis::Value = cmd
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XREADGROUP failed: {e}")))?;

        // Nil on timeout, else [[stream-key, [entries…]]]
        match reply {
            redis::Value::Nil => Ok(Vec::new()),
            redis::Value::Bulk(streams) => {
                let mut out = Vec::new();
                for stream in streams {
                    if let redis::Value::Bulk(pair) = stream {
                        if pair.len() == 2 {
                            out.extend(parse_entries(&pair[1])?);
                        }
                    }
                }
                Ok(out)
            }
            other => Err(QueueError::Protocol(format!("unexpected XREADGROUP reply: {other:?}"))),
        }
    }

    /// `(delivery count, idle ms)` of a pending entry, if it is pending.
    fn pending_info(&self, conn: &mut redis::Connection, id: &str) -> Result<Option<(u32, u64)>, QueueError> {
        let reply: redis::Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XPENDING failed: {e}")))?;

        // [[id, consumer, idle-ms, delivery-count]]
        let redis::Value::Bulk(rows) = reply else {
            return Ok(None);
        };
        let Some(redis::Value::Bulk(row)) = rows.first() else {
            return Ok(None);
        };
        match (row.get(2), row.get(3)) {
            (Some(redis::Value::Int(idle)), Some(redis::Value::Int(count))) => {
                Ok(Some((u32::try_from(*count).unwrap_or(u32::MAX), u64::try_from(*idle).unwrap_or(0))))
            }
            _ => Err(QueueError::Protocol(format!("unexpected XPENDING row: {row:?}"))),
        }
    }

    fn delete_entry(&self, conn: &mut redis::Connection, id: &str) -> Result<(), QueueError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XACK failed: {e}")))?;
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(id)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("XDEL failed: {e}")))?;
        Ok(())
    }
}

impl MessageQueue for RedisStreamsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, body), fields(queue = %self.name), err)]
    fn send(&self, body: String) -> Result<String, QueueError> {
        let mut conn = self.connection()?;
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query(&mut conn)
            .map_err(|e| QueueError::Unavailable(format!("XADD failed: {e}")))?;
        Ok(id)
    }

    fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let count = max_messages.max(1);
        let mut conn = self.connection()?;

        let mut entries = self.reclaim_expired(&mut conn, count)?;
        if entries.is_empty() {
            entries = self.read_new(&mut conn, count, wait)?;
        }

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(body) = entry.body else {
                // Trimmed or deleted under us; drop it from the pending list.
                warn!(queue = %self.name, entry_id = %entry.id, "stream entry without body; discarding");
                self.delete_entry(&mut conn, &entry.id)?;
                continue;
            };
            let receive_count = self
                .pending_info(&mut conn, &entry.id)?
                .map(|(count, _)| count)
                .unwrap_or(1);
            out.push(QueueMessage {
                receipt_handle: format!("{}/{}", entry.id, receive_count),
                message_id: entry.id,
                body,
                receive_count,
            });
        }
        Ok(out)
    }

    fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let (id, count) = receipt_handle
            .rsplit_once('/')
            .and_then(|(id, count)| count.parse::<u32>().ok().map(|c| (id, c)))
            .ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))?;

        let mut conn = self.connection()?;
        match self.pending_info(&mut conn, id)? {
            Some((current, idle_ms)) if current == count && idle_ms < self.visibility_ms() => {
                self.delete_entry(&mut conn, id)
            }
            _ => Err(QueueError::UnknownReceipt(receipt_handle.to_string())),
        }
    }
}

/// Parse `[[id, [field, value, …]], …]`; `Nil` entries are skipped.
fn parse_entries(value: &redis::Value) -> Result<Vec<StreamEntry>, QueueError> {
    let redis::Value::Bulk(entries) = value else {
        return Err(QueueError::Protocol(format!("expected entry list, got {value:?}")));
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let redis::Value::Bulk(parts) = entry else {
            continue;
        };
        let Some(redis::Value::Data(id)) = parts.first() else {
            return Err(QueueError::Protocol("stream entry without id".to_string()));
        };
        let id = String::from_utf8_lossy(id).to_string();

        let mut body = None;
        if let Some(redis::Value::Bulk(fields)) = parts.get(1) {
            for chunk in fields.chunks(2) {
                if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
                    if key.as_slice() == BODY_FIELD.as_bytes() {
                        body = Some(String::from_utf8_lossy(value).to_string());
                    }
                }
            }
        }
        out.push(StreamEntry { id, body });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use redis::Value;

    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_entries_and_skips_nil() {
        let reply = Value::Bulk(vec![
            Value::Bulk(vec![data("1-0"), Value::Bulk(vec![data("body"), data("{}")])]),
            Value::Nil,
            Value::Bulk(vec![data("2-0"), Value::Bulk(vec![])]),
        ]);
        let entries = parse_entries(&reply).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].body.as_deref(), Some("{}"));
        assert_eq!(entries[1].body, None);
    }

    #[test]
    fn non_list_reply_is_a_protocol_error() {
        assert!(matches!(parse_entries(&Value::Int(3)), Err(QueueError::Protocol(_))));
    }
}
