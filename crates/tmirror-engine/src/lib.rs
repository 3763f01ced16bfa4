//! Traffic mirror provisioning engine.
//!
//! Given a network interface observed through a launch notification, a
//! security finding, or a backfill walk, the engine picks the applicable
//! mirroring policy, locates or creates a mirror target for it, and creates a
//! mirror session idempotently.
//!
//! # Architecture
//!
//! ```text
//! [instance event] ─┐
//! [finding event]  ─┼──> [events] ──> ObservedInterface ──> [resolver] ──> PolicyEntry
//! [backfill page]  ─┘                                                         │
//!                                                                             ↓
//!                     [control plane] <── [acquisition] <── [provisioner] <───┘
//! ```
//!
//! # Key Components
//!
//! - [`policy::PolicyStore`]: validated, immutable tag/subnet/network policies
//! - [`resolver::resolve`]: tag > subnet > network priority matching
//! - [`acquisition::TargetAcquirer`]: reuse, create or rotate a mirror target
//! - [`provisioner::SessionProvisioner`]: one session per source interface
//! - [`backfill::BackfillCoordinator`]: paginated walk chained through messages
//! - [`control_plane::ControlPlane`] and [`messaging::Publisher`]: the
//!   external boundaries, with in-memory implementations for dry runs
//!
//! Every invocation runs to completion on its own. The only state shared
//! between invocations is the policy store, which is never mutated after load.

pub mod acquisition;
pub mod audit;
pub mod backfill;
pub mod bootstrap;
pub mod control_plane;
pub mod engine;
pub mod error;
pub mod events;
pub mod messaging;
pub mod policy;
pub mod provisioner;
pub mod resolver;
pub mod settings;
pub mod types;

pub use acquisition::{
    AcquiredTarget, AcquisitionError, AcquisitionState, TargetAcquirer, TargetOrigin,
};
pub use backfill::{BackfillCoordinator, PageReport};
pub use bootstrap::{handle_lifecycle_event, LifecycleEvent, LifecycleOutcome, LifecycleRequest};
pub use control_plane::memory::{FleetSnapshot, InMemoryControlPlane, Operation};
pub use control_plane::{ControlPlane, ControlPlaneError, ControlPlaneResult};
pub use engine::{InterfaceOutcome, MirrorEngine};
pub use error::{BackfillError, BootstrapError, ConfigError, EventError, ProvisionError};
pub use events::{parse_trigger, EventAdapter, FindingInstance, Trigger};
pub use messaging::{ChannelPublisher, Continuation, ContinuationMessage, PublishError, Publisher};
pub use policy::{
    FilterSource, PolicyEntry, PolicyKind, PolicyStore, SessionConfig, TargetCreation, TargetSource,
};
pub use provisioner::{SessionOutcome, SessionProvisioner};
pub use resolver::resolve;
pub use settings::EngineSettings;
pub use types::{ObservedInterface, Tag};
