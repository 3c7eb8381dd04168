use cafe_core::error::{BackendError, KeystoreError};
use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscordError>;

#[derive(Debug, Error, Diagnostic)]
pub enum DiscordError {
    #[error("No Discord token configured")]
    #[diagnostic(code(cafe_discord::missing_token), help("Set DISCORD_TOKEN"))]
    MissingToken,

    #[error("Discord API error: {0}")]
    #[diagnostic(code(cafe_discord::serenity))]
    Serenity(#[from] Box<serenity::Error>),

    #[error("Keystore error: {0}")]
    #[diagnostic(code(cafe_discord::keystore))]
    Keystore(#[from] KeystoreError),

    #[error("Role \"{0}\" not found in guild")]
    #[diagnostic(
        code(cafe_discord::missing_role),
        help("Create the rank roles so members can be promoted")
    )]
    MissingRole(String),
}

impl From<serenity::Error> for DiscordError {
    fn from(err: serenity::Error) -> Self {
        DiscordError::Serenity(Box::new(err))
    }
}

/// Map a serenity failure onto the keystore's transport errors.
pub fn backend_error(err: serenity::Error) -> BackendError {
    if let serenity::Error::Http(http) = &err {
        match http.status_code().map(|status| status.as_u16()) {
            Some(404) => return BackendError::NotFound(err.to_string()),
            Some(403) => return BackendError::Forbidden(err.to_string()),
            _ => {}
        }
    }
    BackendError::Request(err.to_string())
}
