mod auth;
mod connection;
mod connector;
mod dispatcher;
pub mod keys;
mod messages;
mod quirks;
mod session;
mod update;

pub use auth::{Authenticator, SecurityType};
pub use connection::{ServerInfo, VncClient};
pub use connector::VncConnector;
pub use keys::{Modifier, ModifierKeyMap, SpecialKey};
pub use quirks::{QuirkRule, ServerFlavor, ServerQuirks};
