//! # recordplan
//!
//! A record-oriented persistence planning and execution engine for
//! PostgreSQL: given an immutable, externally supplied record-type schema
//! (see [`schema::RecordTypeLibrary`]), compiles fetch/insert/update/delete
//! requests into ordered command chains of parameterized SQL and runs them
//! against a pluggable [`driver::DbDriver`].
//!
//! ## Shape
//!
//! - [`schema`] — the read-only record-type descriptor data model.
//! - [`value_expr`], [`ident`], [`filter`] — the value-expression compiler,
//!   safe SQL identifiers, and the filter/order/range builder.
//! - [`props_tree`], [`query_tree`], [`select_assembler`] — the properties
//!   tree, the joined query tree it drives, and the SELECT assembler built
//!   from both.
//! - [`params`] — the filter-params registry and `?{ref}` placeholder
//!   substitution.
//! - [`command`], [`transaction`], [`exec_context`] — the command model, the
//!   transaction state machine, and the per-execution mutable context they
//!   run against.
//! - [`planner`] — the four DBO planners (fetch/insert/update/delete).
//! - [`dbo`] — the client-visible DBO factory wrapping planner output into
//!   re-executable DBOs.
//! - [`driver`] — the consumed database driver interface, plus an
//!   in-memory fake for tests.
//! - [`monitor`] — the optional record-collections monitor interface.
//! - [`error`] — the crate's error and result types.

pub mod command;
pub mod dbo;
pub mod driver;
pub mod error;
pub mod exec_context;
pub mod filter;
pub mod ident;
pub mod monitor;
pub mod params;
pub mod planner;
pub mod props_tree;
pub mod query_tree;
pub mod schema;
pub mod select_assembler;
pub mod transaction;
pub mod value_expr;

pub use dbo::{Dbo, DeleteDbo, DeleteResult, FetchDbo, FetchResult, FetchSpec, InsertDbo, InsertResult, UpdateDbo, UpdateResult};
pub use driver::{DbDriver, Row};
pub use error::{PlanError, PlanResult};
pub use exec_context::{ExecutionContext, ExecutionOptions};
pub use monitor::RecordCollectionsMonitor;
pub use schema::{RecordTypeDescriptor, RecordTypeLibrary, StaticLibrary};
pub use transaction::TransactionHandle;
