//! Repository functions: one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic, no domain types, only SQL.

pub mod flows;
pub mod versions;
pub mod tasks;
pub mod steps;
pub mod notifications;
