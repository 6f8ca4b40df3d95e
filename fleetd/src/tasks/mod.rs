//! Task engine (spec §4.G): a persisted-queue worker pool that drains
//! `pending` tasks, dispatches each to the owning provider's adapter, and
//! writes progress back as it goes.

pub mod worker;

pub use worker::TaskEngine;
