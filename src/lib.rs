pub mod advice;
pub mod auth;
pub mod chatlog;
pub mod config;
pub mod http_client;
pub mod llm_client;
pub mod profile;
pub mod responder;
pub mod safety;
pub mod server;
pub mod service;
pub mod session;
pub mod traits;
