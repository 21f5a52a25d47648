//! Flow engine: a declarative node/edge graph driving a multi-phase agent
//! loop against a streaming session.
//!
//! A `Flow` is a graph of typed `Node`s joined by `Edge`s. Edges are picked
//! by `Predicate` conditions first, then by the label matching the last
//! decision's choice, then by declaration order. The `FlowRunner` walks the
//! graph, recording progress on the chain held by a `FlowContext`.

pub mod auto_dev;
pub mod context;
pub mod decision;
pub mod edge;
pub mod flow;
pub mod node;
pub mod plan;
pub mod predicate;
pub mod prompt;
pub mod runner;

pub use auto_dev::create_auto_dev_flow;
pub use context::FlowContext;
pub use decision::DecisionPolicy;
pub use edge::Edge;
pub use flow::{Flow, FlowBuilder};
pub use node::{Node, NodeKind};
pub use predicate::Predicate;
pub use prompt::StreamingPromptExecutor;
pub use runner::{FlowOutcome, FlowRunner};
