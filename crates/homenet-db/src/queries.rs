//! Query functions, one module per table.
//!
//! Every function takes `&Connection`, so callers can pass a
//! `rusqlite::Transaction` (which derefs to `Connection`) to compose
//! multi-table writes atomically.

pub mod actions;
pub mod followers;
pub mod identities;
pub mod neighbors;
pub mod settings;
