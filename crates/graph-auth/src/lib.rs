//! OAuth2 authorization-code sessions for the Graph API
//!
//! Everything between "the user wants to sign in" and "here is an
//! authenticated client":
//! 1. `config::Config` loads and validates provider settings
//! 2. `session::SessionManager::authenticate()` runs the browser flow via
//!    the transient `listener::CallbackListener`
//! 3. `token::exchange_code()` / `token::refresh_token()` talk to the token
//!    endpoint
//! 4. `token_store::TokenStore` persists records per identity
//! 5. `SessionManager::client()` hands out a `graph_client::ApiClient`
//!    backed by this session's tokens

pub mod config;
pub mod listener;
pub mod session;
pub mod token;
pub mod token_store;

pub use config::Config;
pub use session::{SessionFactory, SessionManager};
pub use token::TokenResponse;
pub use token_store::{TokenRecord, TokenStore};
