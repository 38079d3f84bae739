//! Caller-side contract: what an operation is and the views it mutates.

use crate::error::{ReadError, TransformError};
use crate::identifier::{Identifier, IdentifierSet};
use crate::txn::{Namespace, Transaction};
use crate::value::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPolicy {
    /// Let the predictor choose the mode on every attempt.
    #[default]
    UsePredictor,
    ForceOptimistic,
    ForceGlobalBlock,
}

pub type BoxedOperation = Box<dyn Operation>;

/// A unit of work applied to both namespaces inside one transaction.
///
/// An operation may be retried. Before every retry the engine calls
/// [`Operation::reset`], which must drop any branches or continuation the
/// failed attempt accumulated. Branches are drained with
/// [`Operation::branches`] after a successful transform; the protected
/// continuation is taken only after a successful commit.
pub trait Operation: Send + 'static {
    fn label(&self) -> &str {
        "operation"
    }

    /// Required unless [`Operation::execution_policy`] forces a mode.
    fn identifiers(&self) -> Option<IdentifierSet>;

    fn transform(
        &mut self,
        persistent: &MapView<'_>,
        ephemeral: &MapView<'_>,
    ) -> Result<(), TransformError>;

    fn branches(&mut self) -> Vec<BoxedOperation> {
        Vec::new()
    }

    fn protected_continuation(&mut self) -> Option<BoxedOperation> {
        None
    }

    fn reset(&mut self) {}

    fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::UsePredictor
    }
}

/// Map-like view over one namespace of a running transaction.
pub struct MapView<'a> {
    txn: &'a dyn Transaction,
    namespace: Namespace,
}

impl<'a> MapView<'a> {
    pub fn new(txn: &'a dyn Transaction, namespace: Namespace) -> Self {
        Self { txn, namespace }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn get(&self, key: &Identifier) -> Result<Option<Value>, ReadError> {
        self.txn.read(self.namespace, key)
    }

    pub fn contains(&self, key: &Identifier) -> Result<bool, ReadError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&self, key: Identifier, value: impl Into<Value>) -> Result<(), ReadError> {
        self.txn.write(self.namespace, key, Some(value.into()))
    }

    pub fn remove(&self, key: Identifier) -> Result<(), ReadError> {
        self.txn.write(self.namespace, key, None)
    }

    /// Missing keys and non-integer values read as `None`.
    pub fn get_integer(&self, key: &Identifier) -> Result<Option<i64>, ReadError> {
        Ok(self.get(key)?.and_then(|v| v.as_integer()))
    }

    /// Adds `delta` to an integer slot (missing counts as zero) and returns
    /// the new value.
    pub fn increment(&self, key: &Identifier, delta: i64) -> Result<i64, ReadError> {
        let next = self.get_integer(key)?.unwrap_or(0).saturating_add(delta);
        self.put(key.clone(), next)?;
        Ok(next)
    }
}

/// Successors scheduled by an [`FnOperation`] body during one attempt.
#[derive(Default)]
pub struct Successors {
    branches: Vec<BoxedOperation>,
    continuation: Option<BoxedOperation>,
}

impl Successors {
    pub fn branch(&mut self, op: impl Operation) {
        self.branches.push(Box::new(op));
    }

    pub fn branch_boxed(&mut self, op: BoxedOperation) {
        self.branches.push(op);
    }

    /// Replaces any continuation set earlier in the same attempt.
    pub fn protect(&mut self, op: impl Operation) {
        self.continuation = Some(Box::new(op));
    }

    fn clear(&mut self) {
        self.branches.clear();
        self.continuation = None;
    }
}

/// Closure-backed [`Operation`] that tracks its own successors.
pub struct FnOperation<F> {
    label: String,
    identifiers: Option<IdentifierSet>,
    policy: ExecutionPolicy,
    body: F,
    successors: Successors,
}

impl<F> FnOperation<F>
where
    F: FnMut(&MapView<'_>, &MapView<'_>, &mut Successors) -> Result<(), TransformError>
        + Send
        + 'static,
{
    pub fn new(label: impl Into<String>, identifiers: IdentifierSet, body: F) -> Self {
        Self {
            label: label.into(),
            identifiers: Some(identifiers),
            policy: ExecutionPolicy::UsePredictor,
            body,
            successors: Successors::default(),
        }
    }

    /// An operation without identifiers; only valid with a forcing policy.
    pub fn unscoped(label: impl Into<String>, policy: ExecutionPolicy, body: F) -> Self {
        Self {
            label: label.into(),
            identifiers: None,
            policy,
            body,
            successors: Successors::default(),
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<F> Operation for FnOperation<F>
where
    F: FnMut(&MapView<'_>, &MapView<'_>, &mut Successors) -> Result<(), TransformError>
        + Send
        + 'static,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn identifiers(&self) -> Option<IdentifierSet> {
        self.identifiers.clone()
    }

    fn transform(
        &mut self,
        persistent: &MapView<'_>,
        ephemeral: &MapView<'_>,
    ) -> Result<(), TransformError> {
        (self.body)(persistent, ephemeral, &mut self.successors)
    }

    fn branches(&mut self) -> Vec<BoxedOperation> {
        std::mem::take(&mut self.successors.branches)
    }

    fn protected_continuation(&mut self) -> Option<BoxedOperation> {
        self.successors.continuation.take()
    }

    fn reset(&mut self) {
        self.successors.clear();
    }

    fn execution_policy(&self) -> ExecutionPolicy {
        self.policy
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("label", &self.label)
            .field("identifiers", &self.identifiers)
            .field("policy", &self.policy)
            .field("pending_branches", &self.successors.branches.len())
            .finish()
    }
}
