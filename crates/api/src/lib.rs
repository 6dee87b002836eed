//! HTTP surface of the two services: routers, request/response mapping and
//! runtime wiring shared by the binaries and the black-box tests.

pub mod app;
pub mod context;
pub mod middleware;
