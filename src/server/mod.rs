//! # HTTP Server Module
//!
//! JSON API over the [`Controller`](crate::controller::Controller). The handlers,
//! request/response bodies and the mapping from job errors to status codes live
//! in the `routes` submodule.

pub mod routes;
