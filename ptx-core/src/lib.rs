//! Core contracts shared by the transaction and executor layers.
//!
//! Holds the work envelopes that travel between partitions, the result-table model, and the
//! seams to the storage engine, the messaging layer, and system procedures.

pub mod containers;
pub mod engine;
pub mod fragment;
pub mod messenger;
pub mod procedure;
pub mod registry;
pub mod table;
