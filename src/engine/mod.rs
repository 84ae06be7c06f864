//! Engine modules — the "brain" that translates desired state into step sequences.
//!
//! The engine layer sits between the manifest (what the machine should look
//! like) and execution (which commands to run). It generates ordered operation
//! plans with per-step dispositions from a probe of the live machine.

pub mod plan;
