//! HTTP API: the provisioning daemon's admin and worker-protocol endpoints.

pub mod app;
