//! Driver/callback abstraction (§6, §9 "Dynamic dispatch", §10.6).
//!
//! A `Callback` is the side effect bound to an event: it runs before the
//! FSM commits the transition (see `fsm::Fsm::do_event`). Only one driver
//! ships with this crate — a container-style descriptor that never talks to
//! a real container runtime, since the runtime itself is an external
//! collaborator out of scope here. The descriptor set is sealed so that a
//! serialized `Fsm` can always reconstruct the right driver on restore.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{OpenStateError, Result};

/// Terminal or in-flight status of a callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Pending,
    Running,
    Paused,
    Complete,
    Failed,
}

/// Snapshot of a callback's lifecycle, returned by every `Callback` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackState {
    pub status: CallbackStatus,
    pub running: bool,
    pub paused: bool,
    pub error: Option<String>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl CallbackState {
    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn complete() -> Self {
        let now = Self::now();
        CallbackState {
            status: CallbackStatus::Complete,
            running: false,
            paused: false,
            error: None,
            started_at: Some(now),
            finished_at: Some(now),
        }
    }
}

/// A side effect executed on an event before the FSM transition commits.
///
/// Every method takes no explicit cancellation context; the async runtime's
/// own task cancellation stands in for it (mirroring the context.Context
/// parameter in the source this trait is modeled on).
#[async_trait]
pub trait Callback: Send + Sync {
    async fn run(&self) -> Result<CallbackState>;
    async fn state(&self) -> Result<CallbackState>;
    async fn wait(&self) -> Result<CallbackState>;

    /// The descriptor this callback was built from, for serialization.
    fn descriptor(&self) -> CallbackDescriptor;
}

/// Sealed set of driver descriptors. Only the container driver ships with
/// this crate; the descriptor carries just enough to reconstruct the
/// `Callback` impl on restore, never live process state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum CallbackDescriptor {
    Container { image: String },
}

impl CallbackDescriptor {
    /// Reconstruct the live `Callback` this descriptor names.
    pub fn build(&self) -> Box<dyn Callback> {
        match self {
            CallbackDescriptor::Container { image } => {
                Box::new(ContainerCallback::new(image.clone()))
            }
        }
    }
}

/// The shipped container-driver callback. It never invokes a real
/// container runtime — that integration is out of scope — but it exercises
/// the same `CallbackFailed` error path a real driver would: an empty
/// image name is treated as a misconfigured callback.
#[derive(Debug, Clone)]
pub struct ContainerCallback {
    image: String,
}

impl ContainerCallback {
    pub fn new(image: String) -> Self {
        ContainerCallback { image }
    }
}

#[async_trait]
impl Callback for ContainerCallback {
    async fn run(&self) -> Result<CallbackState> {
        if self.image.is_empty() {
            return Err(OpenStateError::CallbackFailed(
                "container callback has no image configured".into(),
            ));
        }
        Ok(CallbackState::complete())
    }

    async fn state(&self) -> Result<CallbackState> {
        Ok(CallbackState::complete())
    }

    async fn wait(&self) -> Result<CallbackState> {
        Ok(CallbackState::complete())
    }

    fn descriptor(&self) -> CallbackDescriptor {
        CallbackDescriptor::Container {
            image: self.image.clone(),
        }
    }
}
