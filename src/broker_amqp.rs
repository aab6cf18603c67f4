use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};

use crate::broker::{
    consumer_tag, dead_letter_queue_name, queue_name, Broker, Delivery, DeliveryStream,
    Disposition, Settle,
};
use crate::error::BrokerError;
use crate::types::TenantId;

const PERSISTENT: u8 = 2;

/// Broker gateway over one shared AMQP connection.
///
/// Declarations and publishes go through a single control channel. Every
/// consume stream opens its own channel so that cancelling or closing one
/// tenant never touches another.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    prefetch: u16,
}

impl AmqpBroker {
    pub async fn connect(url: &str, prefetch: u16) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        Self::new(connection, prefetch).await
    }

    pub async fn new(connection: Connection, prefetch: u16) -> Result<Self, BrokerError> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            connection,
            channel,
            prefetch,
        })
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.channel.close(200, "OK").await?;
        self.connection.close(200, "OK").await?;
        Ok(())
    }

    fn durable() -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, tenant_id: &TenantId) -> Result<(), BrokerError> {
        let name = queue_name(tenant_id);
        let dlq_name = dead_letter_queue_name(tenant_id);

        self.channel
            .queue_declare(&dlq_name, Self::durable(), FieldTable::default())
            .await?;

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlq_name.as_str().into()),
        );
        self.channel
            .queue_declare(&name, Self::durable(), args)
            .await?;

        tracing::debug!(tenant = %tenant_id, queue = %name, dlq = %dlq_name, "queues declared");
        Ok(())
    }

    async fn delete_queue(&self, tenant_id: &TenantId) -> Result<(), BrokerError> {
        self.channel
            .queue_delete(&queue_name(tenant_id), QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, tenant_id: &TenantId, payload: &[u8]) -> Result<(), BrokerError> {
        let timestamp = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT)
            .with_timestamp(timestamp);

        let name = queue_name(tenant_id);
        let confirmation = self
            .channel
            .basic_publish(
                "",
                &name,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        confirmed(name, confirmation)
    }

    async fn consume(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let tag = consumer_tag(tenant_id);
        let consumer = channel
            .basic_consume(
                &queue_name(tenant_id),
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Box::new(AmqpDeliveryStream {
            channel,
            consumer,
            consumer_tag: tag,
            cancelled: false,
        }))
    }

    async fn inspect_depth(&self, tenant_id: &TenantId) -> Result<u32, BrokerError> {
        // A passive declare of a missing queue closes the channel it runs on,
        // so it never runs on the shared control channel.
        let channel = self.connection.create_channel().await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        let queue = channel
            .queue_declare(&queue_name(tenant_id), options, FieldTable::default())
            .await;
        if channel.status().connected() {
            if let Err(err) = channel.close(200, "OK").await {
                tracing::debug!(tenant = %tenant_id, error = %err, "failed to close inspection channel");
            }
        }
        Ok(queue?.message_count())
    }
}

/// Map a publisher confirm to the publish outcome.
fn confirmed(queue: String, confirmation: Confirmation) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Nack(_) => Err(BrokerError::PublishNacked(queue)),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

struct AmqpDeliveryStream {
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
    cancelled: bool,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(err) => return Some(Err(err.into())),
        };
        let timestamp = (*delivery.properties.timestamp())
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        Some(Ok(Delivery::new(
            delivery.delivery_tag,
            delivery.data,
            timestamp,
            AmqpSettler {
                acker: delivery.acker,
            },
        )))
    }

    async fn cancel(&mut self) -> Result<(), BrokerError> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel.close(200, "OK").await?;
        }
        Ok(())
    }
}

struct AmqpSettler {
    acker: Acker,
}

#[async_trait]
impl Settle for AmqpSettler {
    async fn settle(&self, _tag: u64, disposition: Disposition) -> Result<(), BrokerError> {
        match disposition {
            Disposition::Commit => {
                self.acker.ack(BasicAckOptions::default()).await?;
            }
            Disposition::Reject => {
                self.acker
                    .reject(BasicRejectOptions { requeue: false })
                    .await?;
            }
        }
        Ok(())
    }
}
