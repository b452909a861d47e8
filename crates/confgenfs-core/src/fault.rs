// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy + a provider decorator applying it

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::{ContentProvider, LayoutEntry, ProviderError, ProviderResult};
use crate::types::{Descriptor, NodeKind};

/// Provider operations a rule can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Materialize,
    Commit,
    Version,
    Layout,
}

/// Individual rule describing which op should fail and how often.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    /// Optional number of leading invocations to skip before injecting faults.
    #[serde(default)]
    pub start_after: u64,
    /// Optional maximum number of injected failures for this rule.
    #[serde(default)]
    pub max_faults: Option<u64>,
    /// Reason carried by the injected error.
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_message() -> String {
    "injected fault".to_string()
}

impl Default for FaultRule {
    fn default() -> Self {
        Self {
            op: FaultOp::Commit,
            start_after: 0,
            max_faults: None,
            message: default_message(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Clone, Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Runtime controller that tracks policy + hit counts.
#[derive(Default)]
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn new(policy: FaultPolicy) -> Self {
        let injector = Self::default();
        injector.set_policy(policy);
        injector
    }

    fn state(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.state();
        guard.counters = vec![RuleCounters::default(); policy.rules.len()];
        guard.policy = policy;
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// Count one invocation of `op` and return the message of the first rule
    /// that fires.
    pub fn should_fault(&self, op: FaultOp) -> Option<String> {
        let mut guard = self.state();
        if !guard.policy.enabled {
            return None;
        }
        let state = &mut *guard;
        for (rule, counters) in state.policy.rules.iter().zip(state.counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            counters.invocations = counters.invocations.saturating_add(1);
            if counters.invocations <= rule.start_after {
                continue;
            }
            if let Some(max) = rule.max_faults {
                if counters.hits >= max {
                    continue;
                }
            }
            counters.hits = counters.hits.saturating_add(1);
            return Some(rule.message.clone());
        }
        None
    }
}

/// Decorator that fails provider calls according to a [`FaultPolicy`] and
/// delegates everything else to `inner`.
pub struct FaultyProvider {
    inner: Arc<dyn ContentProvider>,
    injector: FaultInjector,
}

impl FaultyProvider {
    pub fn new(inner: Arc<dyn ContentProvider>, policy: FaultPolicy) -> Self {
        Self {
            inner,
            injector: FaultInjector::new(policy),
        }
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }
}

impl ContentProvider for FaultyProvider {
    fn materialize(&self, descriptor: &Descriptor) -> ProviderResult<Vec<u8>> {
        if let Some(message) = self.injector.should_fault(FaultOp::Materialize) {
            debug!(descriptor = %descriptor, "injecting materialize fault");
            return Err(ProviderError::GenerationFailed(message));
        }
        self.inner.materialize(descriptor)
    }

    fn commit(&self, descriptor: &Descriptor, data: &[u8]) -> ProviderResult<()> {
        if let Some(message) = self.injector.should_fault(FaultOp::Commit) {
            debug!(descriptor = %descriptor, "injecting commit fault");
            return Err(ProviderError::Rejected(message));
        }
        self.inner.commit(descriptor, data)
    }

    fn version(&self, descriptor: &Descriptor) -> Option<u64> {
        if self.injector.should_fault(FaultOp::Version).is_some() {
            return None;
        }
        self.inner.version(descriptor)
    }

    fn layout(&self, root: &Descriptor) -> ProviderResult<Vec<LayoutEntry>> {
        if let Some(message) = self.injector.should_fault(FaultOp::Layout) {
            return Err(ProviderError::GenerationFailed(message));
        }
        self.inner.layout(root)
    }

    fn child_descriptor(&self, parent: &Descriptor, name: &str) -> Descriptor {
        self.inner.child_descriptor(parent, name)
    }

    fn on_create(&self, descriptor: &Descriptor, kind: NodeKind) -> ProviderResult<()> {
        self.inner.on_create(descriptor, kind)
    }

    fn on_remove(&self, descriptor: &Descriptor, kind: NodeKind) -> ProviderResult<()> {
        self.inner.on_remove(descriptor, kind)
    }

    fn on_rename(&self, from: &Descriptor, to: &Descriptor) -> ProviderResult<()> {
        self.inner.on_rename(from, to)
    }
}
