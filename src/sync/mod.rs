//! Outlet-to-center upload: central store contract, retry policy, transfer
//! execution, scheduling and reporting.

pub mod central;
pub mod executor;
pub mod http;
pub mod policy;
pub mod reporter;
pub mod scheduler;
