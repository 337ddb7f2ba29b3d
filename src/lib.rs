//! Live backup mirror: keeps directory trees copied onto a backup drive,
//! driven by filesystem notifications and periodic content reconciliation.

pub mod backup;
pub mod utils;
