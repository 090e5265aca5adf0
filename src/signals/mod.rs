//! Signal math shared by importance scoring, relationship discovery and
//! triage. Pure functions, no I/O.

pub mod decay;
pub mod fusion;
