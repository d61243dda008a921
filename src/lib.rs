//! awel — a typed operator-DAG execution layer for LLM workflows with a
//! retrieval core.
//!
//! The crate is organised in three layers:
//!
//! - **Runtime** ([`operator`], [`dag`], [`types`], [`metadata`],
//!   [`streaming`]): operators are small async units wired into a validated
//!   DAG; each call walks the topological order once, with branch skipping,
//!   end-of-run hooks, sub-DAG nesting, and SSE streaming at the edge.
//! - **Models & conversation** ([`model`], [`conversation`], [`trigger`]):
//!   provider-neutral requests and outputs, the [`model::client::LlmClient`]
//!   seam, message normalization, and round-based chat history with
//!   persistence and trimming mappers.
//! - **Retrieval** ([`rag`], [`graphrag`]): chunking strategies, index
//!   store contracts with in-memory vector and BM25 implementations,
//!   embedding/keyword/hybrid retrievers with rank fusion, and a
//!   community-summary graph engine.
//!
//! [`config`] and [`telemetry`] carry the ambient concerns; [`utils`] holds
//! the blocking-work escape hatch.
//!
//! # Quick start
//!
//! ```ignore
//! use awel::dag::DagBuilder;
//! use awel::operator::OperatorKind;
//!
//! let builder = DagBuilder::new();
//! let parse = builder.add_operator("parse", OperatorKind::Map(parse_op))?;
//! let answer = builder.add_operator("answer", OperatorKind::Map(llm_op))?;
//! parse >> answer;
//! let dag = builder.build()?;
//! let output = dag.call(serde_json::json!({"user_input": "hi"})).await?;
//! ```

pub mod config;
pub mod conversation;
pub mod dag;
pub mod graphrag;
pub mod metadata;
pub mod model;
pub mod operator;
pub mod rag;
pub mod streaming;
pub mod telemetry;
pub mod trigger;
pub mod types;
pub mod utils;

pub use dag::context::DagContext;
pub use dag::{Dag, DagBuilder, DagError};
pub use metadata::ViewMetadata;
pub use operator::{OperatorError, OperatorKind};
pub use types::{TaskStream, TaskValue};
