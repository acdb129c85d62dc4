use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use trawler_core::async_trait;
use trawler_core::error::{Error, Result};
use trawler_core::request::Request;

use super::RequestQueue;
use crate::serializer::RequestSerializer;

/// Broker-side priority ceiling; AMQP priorities are a single byte.
const MAX_BROKER_PRIORITY: u8 = 255;

/// Priority 0 on the request maps to the middle of the broker range so
/// negative request priorities still order below positive ones.
const PRIORITY_MIDPOINT: i64 = 128;

fn broker_priority(priority: i64) -> u8 {
    priority
        .saturating_add(PRIORITY_MIDPOINT)
        .clamp(0, MAX_BROKER_PRIORITY as i64) as u8
}

/// Shared queue on an AMQP broker.
///
/// The queue is durable and declared with `x-max-priority`, so the broker
/// orders deliveries by priority; broker acknowledgement guarantees a
/// message is delivered to exactly one worker.
pub struct AmqpQueue {
    connection: Connection,
    channel: Channel,
    queue_name: String,
    serializer: Box<dyn RequestSerializer>,
}

impl AmqpQueue {
    pub async fn connect(
        url: &str,
        queue_name: String,
        serializer: Box<dyn RequestSerializer>,
    ) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Queue(format!("amqp connect: {}", e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Queue(format!("amqp channel: {}", e)))?;

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-max-priority"),
            AMQPValue::ShortShortUInt(MAX_BROKER_PRIORITY),
        );
        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map_err(|e| Error::Queue(format!("amqp declare {}: {}", queue_name, e)))?;

        Ok(Self {
            connection,
            channel,
            queue_name,
            serializer,
        })
    }
}

#[async_trait]
impl RequestQueue for AmqpQueue {
    async fn push(&self, request: Request) -> Result<()> {
        let payload = self.serializer.serialize(&request)?;
        let properties = BasicProperties::default()
            .with_priority(broker_priority(request.priority))
            .with_delivery_mode(2); // persistent
        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| Error::Queue(format!("amqp publish: {}", e)))?
            .await
            .map_err(|e| Error::Queue(format!("amqp confirm: {}", e)))?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Request>> {
        let message = self
            .channel
            .basic_get(&self.queue_name, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| Error::Queue(format!("amqp get: {}", e)))?;

        let Some(message) = message else {
            return Ok(None);
        };

        let request = self.serializer.deserialize(&message.delivery.data)?;
        message
            .delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| Error::Queue(format!("amqp ack: {}", e)))?;
        Ok(Some(request))
    }

    async fn len(&self) -> Result<usize> {
        let queue = self
            .channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Queue(format!("amqp passive declare: {}", e)))?;
        Ok(queue.message_count() as usize)
    }

    async fn clear(&self) -> Result<()> {
        self.channel
            .queue_purge(&self.queue_name, QueuePurgeOptions::default())
            .await
            .map_err(|e| Error::Queue(format!("amqp purge: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "closing")
            .await
            .map_err(|e| Error::Queue(format!("amqp channel close: {}", e)))?;
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| Error::Queue(format!("amqp connection close: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_priority_is_clamped_around_midpoint() {
        assert_eq!(broker_priority(0), 128);
        assert_eq!(broker_priority(10), 138);
        assert_eq!(broker_priority(-5), 123);
        assert_eq!(broker_priority(i64::MAX), 255);
        assert_eq!(broker_priority(i64::MIN), 0);
    }

    // Exercises a live broker; run with `cargo test -- --ignored` when a
    // RabbitMQ is available on the default port.
    #[tokio::test]
    #[ignore]
    async fn round_trip_against_live_broker() {
        let queue = AmqpQueue::connect(
            "amqp://127.0.0.1:5672/%2f",
            "test:requests".into(),
            Box::new(crate::serializer::JsonSerializer),
        )
        .await
        .unwrap();
        queue.clear().await.unwrap();

        queue
            .push(Request::get("https://example.com").unwrap())
            .await
            .unwrap();
        let popped = queue.pop().await.unwrap().unwrap();
        assert_eq!(popped.url.as_str(), "https://example.com/");
        assert!(queue.pop().await.unwrap().is_none());

        queue.close().await.unwrap();
    }
}
