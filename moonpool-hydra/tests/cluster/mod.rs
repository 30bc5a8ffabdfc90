//! Cell harness, invariant checkers and scenarios.

pub mod harness;
pub mod invariants;

mod scenarios;
