//! Planners: one module per DBO kind (spec §4.10–§4.13, components C10–C13).
//!
//! Each `build_*` function compiles a record-type descriptor plus call-site
//! arguments into an ordered [`crate::command::Command`] list and a
//! [`crate::params::ParamRegistry`] — a plan, not yet bound to a driver or
//! transaction. [`crate::dbo`] wraps these plans into re-executable DBOs.

pub mod delete;
pub mod fetch;
pub mod insert;
pub mod update;

pub use delete::{build_delete, DeletePlan};
pub use fetch::{build_fetch, FetchPlan};
pub use insert::{build_insert, InsertPlan};
pub use update::{build_update, UpdatePlan};
