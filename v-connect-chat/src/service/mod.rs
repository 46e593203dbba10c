pub mod auth;
pub mod chat;
pub mod health;

pub use auth::{AuthCenterClient, AuthenticatedUser, Authenticator, DevAuthenticator};
pub use chat::{ChatService, DeliveryReport};
