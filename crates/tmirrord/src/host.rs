//! Invocation dispatch.
//!
//! Each handler takes one raw JSON payload, runs it to completion and reports
//! what happened. Unsupported payloads and per-interface failures are logged
//! and reported, not returned as errors; only failures the delivery channel
//! should retry (a failed backfill page, a failed bootstrap publish) or
//! malformed payloads surface as [`DaemonError`](crate::error::DaemonError).

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use tmirror_engine::{
    error_log, handle_lifecycle_event, info_log, parse_trigger, warn_log, BackfillCoordinator,
    Continuation, ControlPlane, EventAdapter, InterfaceOutcome, LifecycleEvent, LifecycleOutcome,
    MirrorEngine, PageReport, Publisher, Trigger,
};

use crate::error::Result;

/// What one invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The payload is not something this handler processes.
    Ignored { reason: String },
    /// The trigger resolved to no interface (e.g. instance not running).
    NoInterface,
    Interface {
        interface_id: String,
        outcome: InterfaceOutcome,
    },
    InterfaceFailed { interface_id: String, error: String },
    Page { report: PageReport },
    Lifecycle { outcome: LifecycleOutcome },
}

pub struct Host<C: ControlPlane + ?Sized, P: Publisher + ?Sized> {
    engine: MirrorEngine<C>,
    publisher: Arc<P>,
}

impl<C: ControlPlane + ?Sized, P: Publisher + ?Sized> Host<C, P> {
    pub fn new(engine: MirrorEngine<C>, publisher: Arc<P>) -> Self {
        Self { engine, publisher }
    }

    pub fn engine(&self) -> &MirrorEngine<C> {
        &self.engine
    }

    /// Handles an instance state-change or security-finding notification.
    ///
    /// A backfill continuation arriving here is run as a backfill page.
    pub async fn handle_event(&self, payload: &Value) -> Result<InvocationOutcome> {
        let trigger = match parse_trigger(payload) {
            Ok(trigger) => trigger,
            Err(e) if e.is_unsupported() => {
                warn_log!("Host", error = %e, "The event type is either invalid or not supported");
                return Ok(InvocationOutcome::Ignored { reason: e.to_string() });
            }
            Err(e) => return Err(e.into()),
        };

        if let Trigger::BackfillContinuation(continuation) = &trigger {
            return self.run_page(continuation).await;
        }

        let adapter = EventAdapter::new(self.engine.control_plane(), self.engine.settings());
        let Some(iface) = adapter.observe(&trigger).await? else {
            return Ok(InvocationOutcome::NoInterface);
        };
        info_log!("Host", interface = %iface, "Parsed interface");

        match self.engine.handle_interface(&iface).await {
            Ok(outcome) => Ok(InvocationOutcome::Interface {
                interface_id: iface.interface_id().to_string(),
                outcome,
            }),
            Err(e) => {
                error_log!(
                    "Host",
                    interface_id = %iface.interface_id(),
                    error = %e,
                    "Failed to set up traffic mirroring"
                );
                Ok(InvocationOutcome::InterfaceFailed {
                    interface_id: iface.interface_id().to_string(),
                    error: e.to_string(),
                })
            }
        }
    }

    /// Handles one backfill continuation message.
    pub async fn handle_backfill(&self, payload: &Value) -> Result<InvocationOutcome> {
        match parse_trigger(payload) {
            Ok(Trigger::BackfillContinuation(continuation)) => self.run_page(&continuation).await,
            Ok(_) => {
                warn_log!("Host", "Payload is not a backfill continuation");
                Ok(InvocationOutcome::Ignored {
                    reason: "not a backfill continuation".to_string(),
                })
            }
            Err(e) if e.is_unsupported() => {
                warn_log!("Host", error = %e, "The event type is either invalid or not supported");
                Ok(InvocationOutcome::Ignored { reason: e.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handles one provisioning lifecycle event.
    pub async fn handle_bootstrap(&self, payload: &Value) -> Result<InvocationOutcome> {
        let event: LifecycleEvent = serde_json::from_value(payload.clone())?;
        let outcome =
            handle_lifecycle_event(&event, self.publisher.as_ref(), self.engine.settings()).await?;
        Ok(InvocationOutcome::Lifecycle { outcome })
    }

    async fn run_page(&self, continuation: &Continuation) -> Result<InvocationOutcome> {
        let coordinator =
            BackfillCoordinator::new(self.engine.clone(), Arc::clone(&self.publisher));
        let report = coordinator.run_backfill_page(continuation).await?;
        Ok(InvocationOutcome::Page { report })
    }
}
