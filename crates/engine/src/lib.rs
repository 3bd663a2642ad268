//! Response Orchestration Engine - the decision core of Parley
//!
//! This crate takes one inbound conversation message and decides,
//! autonomously, whether to draft an AI reply (possibly calling external
//! tools), hand the conversation to a human, or do nothing:
//!
//! 1. **Retrieval** (`retrieval`) - Assemble knowledge-bank and
//!    past-conversation context above a similarity threshold, backed by the
//!    content-addressed embedding cache (`embedding`)
//! 2. **Agentic loop** (`orchestrator`) - Drive the model through a bounded
//!    tool-call loop with the registered tool schemas attached
//! 3. **Tool execution** (`tools`) - Validate loosely-typed parameters
//!    against the declared schema, then call the customer's HTTP backend
//! 4. **Escalation** (`escalation`) - Transfer ownership to a human when
//!    the model asks for it, a staff member replies, or a reply is flagged
//! 5. **Fanout** (`fanout`, `worker`) - Enqueue idempotent side-effect jobs
//!    keyed by message id; a background worker drains them so a slow
//!    notification path never delays the reply
//!
//! # Key Types
//!
//! - `ResponseOrchestrator` - the main control loop
//! - `ModelProvider` / `EmbeddingProvider` - pluggable provider seams
//! - `EventFanout` / `OutboxWorker` - the decoupled side-effect pipeline
//!
//! # Safety Principle
//!
//! Escalation signals are never dropped: if the escalation event cannot be
//! recorded, the turn fails closed and no AI reply is sent.

pub mod embedding;
pub mod escalation;
pub mod fanout;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod realtime;
pub mod retrieval;
pub mod tools;
pub mod worker;
