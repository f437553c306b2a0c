//! Provider reconciliation engines (spec §4.7-§4.9): collection sync, item
//! sync, and the recursive cross-resource mover. All three sit above the
//! Command Handlers and Transaction Sequence — they never touch SQL
//! directly, the same way `commands::*` doesn't.

pub mod collection_sync;
pub mod item_sync;
pub mod recursive_mover;
