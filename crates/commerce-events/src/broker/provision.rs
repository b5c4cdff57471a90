//! Idempotent broker provisioning.
//!
//! Every step looks the resource up before creating it, so provisioning can
//! run on every startup and from several processes at once.

use super::{BrokerClient, ConsumerResource, SubscriptionFilter};
use crate::config::{EventBusConfig, DEAD_LETTER_RETENTION, MAX_DELIVERY_COUNT};
use crate::envelope::{consumer_resource_name, dead_letter_name};
use crate::error::{EventBusError, EventBusResult};
use tracing::{debug, info};

/// Describe the consumer resource for an event type.
pub fn consumer_resource(config: &EventBusConfig, event_type: &str) -> ConsumerResource {
    let name = consumer_resource_name(&config.topic_name, event_type);
    let dead_letter = config
        .dead_letter_target
        .clone()
        .unwrap_or_else(|| dead_letter_name(&name));

    ConsumerResource {
        name,
        topic: config.topic_name.clone(),
        event_type: event_type.to_string(),
        filter: SubscriptionFilter::event_type(event_type),
        dead_letter,
        max_delivery_count: MAX_DELIVERY_COUNT,
        retention: config.message_ttl(),
        lock_duration: config.lock_duration(),
    }
}

/// Ensure the shared topic exists.
///
/// Creates it when `auto_create_entities` is on, otherwise fails with
/// [`EventBusError::InfrastructureMissing`].
pub async fn provision_topic(broker: &dyn BrokerClient, config: &EventBusConfig) -> EventBusResult<()> {
    let topic = &config.topic_name;
    if broker.topic_exists(topic).await? {
        debug!(topic = %topic, broker = broker.name(), "Topic already exists");
        return Ok(());
    }

    if !config.auto_create_entities {
        return Err(EventBusError::InfrastructureMissing(format!("topic '{}'", topic)));
    }

    broker.create_topic(topic, config.message_ttl()).await?;
    info!(topic = %topic, broker = broker.name(), "Created topic");
    Ok(())
}

/// Ensure the consumer resource for `event_type` exists and is wired.
///
/// The topic must already exist (see [`provision_topic`]). With
/// `auto_create_entities` off only existence is verified; the filter and
/// redrive policy of pre-provisioned resources are left untouched.
pub async fn provision_consumer(
    broker: &dyn BrokerClient,
    config: &EventBusConfig,
    event_type: &str,
) -> EventBusResult<ConsumerResource> {
    let resource = consumer_resource(config, event_type);

    if !config.auto_create_entities {
        if !broker.consumer_exists(&resource).await? {
            return Err(EventBusError::InfrastructureMissing(format!(
                "consumer resource '{}'",
                resource.name
            )));
        }
        if !broker.dead_letter_exists(&resource.dead_letter).await? {
            return Err(EventBusError::InfrastructureMissing(format!(
                "dead-letter target '{}'",
                resource.dead_letter
            )));
        }
        debug!(consumer = %resource.name, "Verified pre-provisioned consumer resource");
        return Ok(resource);
    }

    if !broker.consumer_exists(&resource).await? {
        broker.create_consumer(&resource).await?;
        info!(
            consumer = %resource.name,
            topic = %resource.topic,
            event_type = %event_type,
            "Created consumer resource"
        );
    }

    broker.apply_filter(&resource).await?;

    if !broker.dead_letter_exists(&resource.dead_letter).await? {
        broker
            .create_dead_letter(&resource.dead_letter, DEAD_LETTER_RETENTION)
            .await?;
        info!(dead_letter = %resource.dead_letter, "Created dead-letter target");
    }

    broker.apply_redrive(&resource).await?;
    broker.authorize_topic(&resource).await?;

    info!(
        consumer = %resource.name,
        filter = %resource.filter.to_sql(),
        max_delivery_count = resource.max_delivery_count,
        "Consumer resource provisioned"
    );
    Ok(resource)
}
