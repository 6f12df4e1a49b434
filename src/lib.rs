//! Navigator — a front-end HTTP server for a multi-tenant application
//! fleet. Requests are classified and routed to static files, CGI scripts,
//! explicit proxy routes, the WebSocket broadcast hub, or per-tenant backend
//! workers that are started on demand and stopped when idle.

pub mod access_log;
pub mod assets;
pub mod auth;
pub mod cgi;
pub mod config;
pub mod dispatch;
pub mod hooks;
pub mod hub;
pub mod logging;
pub mod pidfile;
pub mod ports;
pub mod proxy;
pub mod server;
pub mod singleflight;
pub mod supervisor;
