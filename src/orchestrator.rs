// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Orchestrator
//!
//! Called by the dispatcher after a handler failed and the delivery was
//! rejected. The message body is republished, unchanged, either into the
//! delay tier matching its new retry count or, once the retry budget is
//! spent, according to the configured [`ExhaustionPolicy`].

use crate::{
    channel::AmqpChannel,
    configs::ExhaustionPolicy,
    dispatcher::InboundDelivery,
    errors::AmqpError,
    handler::EventKey,
    publisher::JSON_CONTENT_TYPE,
    retry::{RetryTier, RetryTopology, PARKING_ROUTING_KEY},
};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, info, warn};

/// Header carrying the number of retries already spent on a message
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Header stamped on parked messages with the time they were parked
pub const AMQP_HEADERS_EXHAUSTED_AT: &str = "x-exhausted-at";
/// AMQP delivery mode for messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reads `x-retry-count` from `headers`; absent or non-integer values count as 0.
pub fn retry_count(headers: &FieldTable) -> u32 {
    let value = match headers.inner().get(AMQP_HEADERS_RETRY_COUNT) {
        Some(value) => value,
        None => return 0,
    };

    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::Float(v) => *v as i64,
        AMQPValue::Double(v) => *v as i64,
        _ => 0,
    };

    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

/// What happened to a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Published into a delay tier; it comes back after the tier delay.
    Scheduled {
        retry_count: u32,
        tier: RetryTier,
        queue: String,
    },
    /// Budget exhausted; moved to the parking queue for good.
    Parked { retry_count: u32, queue: String },
    /// Budget exhausted; put straight back on the primary queue.
    Requeued { retry_count: u32 },
}

pub struct RetryOrchestrator<C: AmqpChannel + ?Sized> {
    channel: Arc<C>,
    topology: RetryTopology,
    max_retries: u32,
    policy: ExhaustionPolicy,
}

impl<C: AmqpChannel + ?Sized> RetryOrchestrator<C> {
    pub fn new(
        channel: Arc<C>,
        topology: RetryTopology,
        max_retries: u32,
        policy: ExhaustionPolicy,
    ) -> RetryOrchestrator<C> {
        RetryOrchestrator {
            channel,
            topology,
            max_retries,
            policy,
        }
    }

    /// Republishes a delivery whose handler failed.
    ///
    /// The original delivery must already be rejected. Publish failures are
    /// logged and returned; they are not retried.
    pub async fn retry(
        &self,
        delivery: &InboundDelivery,
        key: &EventKey,
    ) -> Result<RetryOutcome, AmqpError> {
        self.topology.ensure_retry_exchange(&*self.channel).await?;

        let current = retry_count(&delivery.headers);
        let next = current.saturating_add(1);

        if next > self.max_retries {
            return match self.policy {
                ExhaustionPolicy::Park => self.park(delivery, key, current).await,
                ExhaustionPolicy::Requeue => self.requeue(delivery, key, current).await,
            };
        }

        info!(event = %key, retry_count = next, "setting retry count");

        let tier = self.topology.ensure_tier(&*self.channel, next).await?;

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(i64::from(next)),
        );

        self.channel
            .publish(
                self.topology.names().retry_exchange(),
                &tier.routing_key,
                &delivery.data,
                persistent_properties(FieldTable::from(headers)),
            )
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    event = %key,
                    queue = tier.queue_name.as_str(),
                    "failure to schedule retry, message is lost"
                )
            })?;

        Ok(RetryOutcome::Scheduled {
            retry_count: next,
            tier: tier.tier,
            queue: tier.queue_name,
        })
    }

    async fn park(
        &self,
        delivery: &InboundDelivery,
        key: &EventKey,
        current: u32,
    ) -> Result<RetryOutcome, AmqpError> {
        let queue = self.topology.ensure_parking(&*self.channel).await?;

        let mut headers = delivery.headers.inner().clone();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(i64::from(current)),
        );
        headers.insert(
            ShortString::from(AMQP_HEADERS_EXHAUSTED_AT),
            AMQPValue::LongString(LongString::from(chrono::Utc::now().to_rfc3339())),
        );

        self.channel
            .publish(
                self.topology.names().retry_exchange(),
                PARKING_ROUTING_KEY,
                &delivery.data,
                persistent_properties(FieldTable::from(headers)),
            )
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    event = %key,
                    "failure to park message, message is lost"
                )
            })?;

        error!(
            event = %key,
            retry_count = current,
            queue = queue.as_str(),
            "exhausted max retries, message parked"
        );

        Ok(RetryOutcome::Parked {
            retry_count: current,
            queue,
        })
    }

    async fn requeue(
        &self,
        delivery: &InboundDelivery,
        key: &EventKey,
        current: u32,
    ) -> Result<RetryOutcome, AmqpError> {
        let names = self.topology.names();

        warn!(
            event = %key,
            retry_count = current,
            "exhausted max retries, requeuing on the primary queue"
        );

        self.channel
            .publish(
                names.exchange(),
                names.routing_key(),
                &delivery.data,
                persistent_properties(delivery.headers.clone()),
            )
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    event = %key,
                    "failure to requeue message, message is lost"
                )
            })?;

        Ok(RetryOutcome::Requeued {
            retry_count: current,
        })
    }
}

fn persistent_properties(headers: FieldTable) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel,
        topology::{TopologyNames, Worker},
    };

    const BODY: &[u8] = br#"{"action":"log","type":"activity","data":{}}"#;

    fn delivery(count: Option<AMQPValue>) -> InboundDelivery {
        let mut headers = BTreeMap::new();
        if let Some(count) = count {
            headers.insert(ShortString::from(AMQP_HEADERS_RETRY_COUNT), count);
        }
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        InboundDelivery {
            delivery_tag: 7,
            data: BODY.to_vec(),
            headers: FieldTable::from(headers),
        }
    }

    fn header(props: &BasicProperties, key: &str) -> Option<AMQPValue> {
        props
            .headers()
            .as_ref()
            .and_then(|h| h.inner().get(key).cloned())
    }

    fn channel_with_topology() -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel.expect_declare_queue().returning(|_| Ok(()));
        channel.expect_bind_queue().returning(|_| Ok(()));
        channel
    }

    fn orchestrator(
        channel: MockAmqpChannel,
        max_retries: u32,
        policy: ExhaustionPolicy,
    ) -> RetryOrchestrator<MockAmqpChannel> {
        RetryOrchestrator::new(
            Arc::new(channel),
            RetryTopology::new(TopologyNames::new("pm", Worker::Activity)),
            max_retries,
            policy,
        )
    }

    #[test]
    fn retry_count_reads_any_integer_width() {
        assert_eq!(retry_count(&FieldTable::default()), 0);
        assert_eq!(retry_count(&delivery(None).headers), 0);
        assert_eq!(
            retry_count(&delivery(Some(AMQPValue::LongInt(2))).headers),
            2
        );
        assert_eq!(
            retry_count(&delivery(Some(AMQPValue::ShortShortUInt(3))).headers),
            3
        );
        assert_eq!(
            retry_count(&delivery(Some(AMQPValue::LongLongInt(-4))).headers),
            0
        );
        assert_eq!(
            retry_count(&delivery(Some(AMQPValue::LongString(LongString::from("1")))).headers),
            0
        );
    }

    #[tokio::test]
    async fn first_failure_goes_to_the_30s_tier_with_count_one() {
        let mut channel = channel_with_topology();
        channel
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                exchange == "pm.activity.retry.exchange"
                    && key == "retry.30s.route"
                    && payload == BODY
                    && *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE)
                    && props.headers().as_ref().map(|h| h.inner().len()) == Some(1)
                    && header(props, AMQP_HEADERS_RETRY_COUNT)
                        == Some(AMQPValue::LongLongInt(1))
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let orchestrator = orchestrator(channel, 1, ExhaustionPolicy::Park);
        let outcome = orchestrator
            .retry(&delivery(None), &EventKey::log_activity())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RetryOutcome::Scheduled {
                retry_count: 1,
                tier: RetryTier::THIRTY_SECONDS,
                queue: "pm.activity.retry.30s".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn every_count_within_budget_lands_in_its_tier() {
        let expected = [
            (0, RetryTier::THIRTY_SECONDS),
            (1, RetryTier::FIVE_MINUTES),
            (2, RetryTier::THIRTY_MINUTES),
            (3, RetryTier::THIRTY_MINUTES),
        ];

        for (current, tier) in expected {
            let mut channel = channel_with_topology();
            let routing_key = tier.routing_key();
            channel
                .expect_publish()
                .withf(move |_, key, _, props| {
                    key == routing_key
                        && header(props, AMQP_HEADERS_RETRY_COUNT)
                            == Some(AMQPValue::LongLongInt(i64::from(current) + 1))
                })
                .times(1)
                .returning(|_, _, _, _| Ok(()));

            let orchestrator = orchestrator(channel, 5, ExhaustionPolicy::Park);
            let outcome = orchestrator
                .retry(
                    &delivery(Some(AMQPValue::LongLongInt(i64::from(current)))),
                    &EventKey::log_activity(),
                )
                .await
                .unwrap();

            assert!(matches!(
                outcome,
                RetryOutcome::Scheduled { retry_count, tier: t, .. }
                    if retry_count == current + 1 && t == tier
            ));
        }
    }

    #[tokio::test]
    async fn exhausted_message_is_parked_with_its_count_unchanged() {
        let mut channel = channel_with_topology();
        channel
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                exchange == "pm.activity.retry.exchange"
                    && key == PARKING_ROUTING_KEY
                    && payload == BODY
                    && header(props, AMQP_HEADERS_RETRY_COUNT)
                        == Some(AMQPValue::LongLongInt(1))
                    && header(props, AMQP_HEADERS_EXHAUSTED_AT).is_some()
                    && header(props, "traceparent").is_some()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let orchestrator = orchestrator(channel, 1, ExhaustionPolicy::Park);
        let outcome = orchestrator
            .retry(
                &delivery(Some(AMQPValue::LongLongInt(1))),
                &EventKey::log_activity(),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RetryOutcome::Parked {
                retry_count: 1,
                queue: "pm.activity.parked".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn exhausted_message_is_requeued_unchanged_in_compat_mode() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().times(1).returning(|_| Ok(()));
        channel.expect_declare_queue().never();
        channel
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                exchange == "pm.exchange"
                    && key == "pm.activity.route"
                    && payload == BODY
                    && header(props, AMQP_HEADERS_RETRY_COUNT)
                        == Some(AMQPValue::LongLongInt(1))
                    && header(props, AMQP_HEADERS_EXHAUSTED_AT).is_none()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let orchestrator = orchestrator(channel, 1, ExhaustionPolicy::Requeue);
        let outcome = orchestrator
            .retry(
                &delivery(Some(AMQPValue::LongLongInt(1))),
                &EventKey::log_activity(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::Requeued { retry_count: 1 });
    }

    #[tokio::test]
    async fn zero_budget_skips_the_tiers_entirely() {
        let mut channel = channel_with_topology();
        channel
            .expect_publish()
            .withf(|_, key, _, _| key == PARKING_ROUTING_KEY)
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let orchestrator = orchestrator(channel, 0, ExhaustionPolicy::Park);
        let outcome = orchestrator
            .retry(&delivery(None), &EventKey::log_activity())
            .await
            .unwrap();

        assert!(matches!(outcome, RetryOutcome::Parked { retry_count: 0, .. }));
    }

    #[tokio::test]
    async fn publish_failure_is_returned_not_retried() {
        let mut channel = channel_with_topology();
        channel
            .expect_publish()
            .times(1)
            .returning(|exchange, _, _, _| Err(AmqpError::PublishingError(exchange.to_owned())));

        let orchestrator = orchestrator(channel, 1, ExhaustionPolicy::Park);
        let err = orchestrator
            .retry(&delivery(None), &EventKey::log_activity())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::PublishingError("pm.activity.retry.exchange".to_owned())
        );
    }

    #[tokio::test]
    async fn retry_exchange_failure_stops_before_publishing() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_exchange()
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));
        channel.expect_publish().never();

        let orchestrator = orchestrator(channel, 1, ExhaustionPolicy::Park);
        assert!(orchestrator
            .retry(&delivery(None), &EventKey::log_activity())
            .await
            .is_err());
    }
}
