use crate::unitset::UnitSet;
use async_trait::async_trait;
use kube::{Client, Resource};
use kube_runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use log::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Sink for events attached to a UnitSet. Recording never fails the caller.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, set: &UnitSet, type_: EventType, reason: &str, note: String);
}

pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client, controller_name: &str) -> Self {
        KubeRecorder {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("HOSTNAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeRecorder {
    async fn record(&self, set: &UnitSet, type_: EventType, reason: &str, note: String) {
        let recorder =
            Recorder::new(self.client.clone(), self.reporter.clone(), set.object_ref(&()));
        let event = Event {
            type_: match type_ {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!("failed to publish {} event for UnitSet {:?}: {}", reason, set.metadata.name, e);
        }
    }
}
