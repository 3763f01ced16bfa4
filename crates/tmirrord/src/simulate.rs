//! Local dry run against an in-memory fleet.
//!
//! Events are handled in order, then the backfill walk (if requested) is
//! started through the bootstrap hook and chained through the in-process
//! channel until no continuation is published. Every continuation is
//! re-wrapped as a notification payload so it goes through the same parsing
//! a real delivery would.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use tmirror_engine::bootstrap::{ResourceProperties, APP_CONFIGURATION_RESOURCE};
use tmirror_engine::{
    info_log, ChannelPublisher, ContinuationMessage, EngineSettings, FleetSnapshot,
    InMemoryControlPlane, LifecycleEvent, LifecycleRequest, MirrorEngine, PolicyStore,
};

use crate::error::Result;
use crate::host::{Host, InvocationOutcome};

/// Result of a dry run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub invocations: Vec<InvocationOutcome>,
    pub published: Vec<ContinuationMessage>,
    pub fleet: FleetSnapshot,
}

pub struct Simulation {
    pub fleet: FleetSnapshot,
    pub policies: PolicyStore,
    pub settings: EngineSettings,
    pub topic: String,
    pub start_backfill: bool,
    pub events: Vec<Value>,
}

/// Wraps a continuation as the notification payload that delivers it.
pub fn notification_payload(message: &ContinuationMessage) -> Value {
    let attributes: serde_json::Map<String, Value> = message
        .attributes
        .iter()
        .map(|(name, value)| (name.clone(), json!({"Type": "String", "Value": value})))
        .collect();
    json!({"Records": [{"Sns": {
        "TopicArn": message.topic,
        "Message": message.body,
        "MessageAttributes": attributes,
    }}]})
}

impl Simulation {
    pub async fn run(self) -> Result<SimulationReport> {
        let control_plane = Arc::new(InMemoryControlPlane::from_snapshot(self.fleet));
        let (publisher, mut rx) = ChannelPublisher::new();
        let engine = MirrorEngine::new(Arc::clone(&control_plane), self.policies, self.settings);
        let host = Host::new(engine, Arc::new(publisher));

        let mut invocations = Vec::new();
        let mut published = Vec::new();

        for event in &self.events {
            invocations.push(host.handle_event(event).await?);
        }

        if self.start_backfill {
            let create = LifecycleEvent {
                request_type: LifecycleRequest::Create,
                resource_type: APP_CONFIGURATION_RESOURCE.to_string(),
                resource_properties: ResourceProperties {
                    topic: Some(self.topic.clone()),
                },
            };
            invocations.push(host.handle_bootstrap(&serde_json::to_value(&create)?).await?);
        }

        // Every page publishes before it returns, so an empty channel means
        // the walk has ended.
        while let Ok(message) = rx.try_recv() {
            info_log!(
                "Simulation",
                topic = %message.topic,
                next_token = message.next_token().unwrap_or(""),
                "Delivering continuation"
            );
            let payload = notification_payload(&message);
            published.push(message);
            invocations.push(host.handle_backfill(&payload).await?);
        }

        Ok(SimulationReport {
            invocations,
            published,
            fleet: control_plane.snapshot(),
        })
    }
}
