//! Speculative operation engine.
//!
//! Callers submit [`Operation`]s that mutate a persistent and an ephemeral
//! namespace. The [`Engine`] runs them concurrently on a work-stealing pool,
//! choosing per attempt between optimistic execution, a global stall, and
//! fine-grained waiting on predecessors' staged writes. Operations may fork
//! branches and schedule one protected continuation that runs exactly once
//! after the operation and its whole branch tree have committed.
//!
//! The transactional store is pluggable through [`TransactionBackend`];
//! [`MemoryBackend`] is the in-process reference implementation.

pub mod config;
pub mod engine;
pub mod error;
pub mod identifier;
pub mod memory;
pub mod operation;
pub mod predictor;
pub mod txn;
pub mod value;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, OperationHandle};
pub use error::{BackendError, EngineError, ErrorCode, ReadError, TransformError};
pub use identifier::{Identifier, IdentifierSet, identifier_set};
pub use memory::{MemoryBackend, MemoryBackendConfig, MemoryBackendStats};
pub use operation::{BoxedOperation, ExecutionPolicy, FnOperation, MapView, Operation, Successors};
pub use predictor::{
    ExecutionMode, FixedPredictor, ModePredictor, OverlapPredictor, OverlapPredictorConfig,
    Prediction,
};
pub use txn::{
    CommitStatus, Namespace, PendingSnapshot, Position, SoftState, Transaction,
    TransactionBackend, TxnId, TxnScope,
};
pub use value::Value;
