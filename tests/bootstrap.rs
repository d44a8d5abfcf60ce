//! Scenario tests for multi-cloud mesh bootstrap
//!
//! These run the real execution driver against in-memory fakes of the cloud
//! backends, the chart installer and the cluster API, so they need no cloud
//! account or cluster:
//!
//! ```bash
//! cargo test --test bootstrap
//! ```

mod bootstrap_tests;
