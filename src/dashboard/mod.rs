//! JSON dashboard API. Rendering is left to whatever front-end consumes it.

pub mod routes;

pub use routes::{DashboardState, dashboard_routes};
