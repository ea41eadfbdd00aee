//! Cron & Supervisor Syncers (spec.md §4.6, §4.7): reconcile declared
//! per-site schedules and worker programs with observed state on a host.

pub mod cron;
pub mod supervisor;
