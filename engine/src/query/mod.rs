//! Live query pipeline: IR, builder, optimizer, compiler and runtime.

pub mod builder;
pub mod compiler;
pub mod dataflow;
pub mod evaluate;
pub mod ir;
pub mod live;
pub mod optimizer;

pub use builder::Query;
pub use compiler::{compile_query, CompiledQuery};
pub use ir::{Expr, JoinKind, OrderByClause, QueryIr};
pub use live::LiveQuery;
pub use optimizer::optimize;
