pub mod artwork;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod media_api;
pub mod oauth_client;
pub mod remote_credentials;
