//! Well alerts library
//!
//! Weather cache, alert rules, audience selection and push dispatch, shared
//! by the daemon, the operator tools and the integration tests.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
