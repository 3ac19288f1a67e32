pub mod auth_flow;
pub mod credentials;
pub mod media_service;
pub mod session;
pub mod token_refresher;
