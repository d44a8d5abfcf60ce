//! Bootstrap scenarios
//!
//! - `fakes`: in-memory clouds, installer and cluster API
//! - `scenarios`: stories of an operator bootstrapping two clouds into one
//!   mesh, including partial failure and cancellation

mod fakes;
mod scenarios;
