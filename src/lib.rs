#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Opflow Core
//!
//! Operation/task orchestration engine for the opflow virtualization
//! control plane.
//!
//! ## Overview
//!
//! The control plane accepts high-level commands ("converge this virtual
//! machine", "update inventory"), turns each into a durable **Operation**,
//! fans it out into one or more **Tasks** addressed to specific agents,
//! tracks acceptance/progress/completion through a message bus, and
//! reconciles final status. The engine provides exactly-once *effective*
//! semantics (operation dedup, terminal-state monotonicity) on top of an
//! at-least-once messaging substrate.
//!
//! ## Module Organization
//!
//! - [`models`] - Operation aggregate, statuses, resources, progress log
//! - [`store`] - Transactional operation persistence (in-memory + Postgres)
//! - [`messaging`] - Wire contracts, envelope codec, transport abstraction
//! - [`dispatcher`] - Operation creation, dedup and resource fan-out
//! - [`saga`] - Correlated per-operation state machines and step sagas
//! - [`failure`] - Poison-message convergence into ordinary failure events
//! - [`agents`] - Agent resolution, task routing and agent-side intake
//! - [`config`] - Runtime configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use opflow_core::config::OrchestratorConfig;
//! use opflow_core::messaging::{CommandRegistry, InMemoryTransport};
//! use opflow_core::store::{InMemoryOperationStore, StaticProjectResolver};
//! use opflow_core::dispatcher::OperationDispatcher;
//!
//! let config = OrchestratorConfig::default();
//! let transport = Arc::new(InMemoryTransport::new(config.max_delivery_attempts));
//! let store = Arc::new(InMemoryOperationStore::new());
//! let registry = CommandRegistry::new();
//! let dispatcher = OperationDispatcher::new(
//!     store,
//!     Arc::new(StaticProjectResolver::new()),
//!     transport,
//!     registry,
//! );
//! ```

pub mod agents;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod failure;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod saga;
pub mod store;

pub use config::OrchestratorConfig;
pub use dispatcher::{DispatchResult, OperationDispatcher};
pub use error::{OrchestratorError, Result};
pub use failure::FailureConvergenceHandler;
pub use models::{Operation, OperationLogEntry, OperationStatus, Resource, ResourceType};
pub use saga::SagaWorkflowEngine;
