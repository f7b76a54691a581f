//! Domain types and logic independent of any transport or database.

pub mod action;
pub mod models;
pub mod sequencer;
pub mod settings;
