//! HTTP Middleware
//! Mission: Request logging for operator visibility

pub mod logging;
