//! Unified error handling for ragold.
//!
//! Each domain gets its own error enum; handlers translate them into the
//! client-visible behavior the protocol expects (auth reject screens,
//! message boxes, colored chat-back, or a silent drop).

use thiserror::Error;

/// Errors raised while authenticating or mutating accounts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("serial number is zero or username is missing")]
    NoUsername,

    #[error("missing account")]
    MissingAccount,

    #[error("incorrect access key")]
    IncorrectAccessKey,

    #[error("incorrect password")]
    IncorrectPassword,

    #[error("account is banned")]
    AccountBanned,

    #[error("credential is already registered to another account")]
    CredentialInUse,

    #[error("credential is not registered to this account")]
    CredentialNotRegistered,
}

impl AccountError {
    /// Static code string for log labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoUsername => "no_username",
            Self::MissingAccount => "missing_account",
            Self::IncorrectAccessKey => "incorrect_access_key",
            Self::IncorrectPassword => "incorrect_password",
            Self::AccountBanned => "account_banned",
            Self::CredentialInUse => "credential_in_use",
            Self::CredentialNotRegistered => "credential_not_registered",
        }
    }
}

/// Errors raised by command handlers. The dispatcher decides, per variant,
/// whether the client survives.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A chat-command precondition failed; the text goes back to the sender
    /// as a colored chat message.
    #[error("{0}")]
    PreconditionFailed(String),

    /// The command number has no handler for this version. Logged and
    /// dropped.
    #[error("unknown command {command:#04x} for version {version}")]
    UnknownCommand {
        command: u16,
        version: ragol_proto::Version,
    },

    /// A payload failed shape validation. Disconnects the channel.
    #[error("malformed payload: {0}")]
    Malformed(#[from] ragol_proto::ParseError),

    /// The client must be disconnected (ban screens, protocol violations).
    #[error("disconnect: {0}")]
    Disconnect(String),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Lobby(#[from] LobbyError),

    #[error(transparent)]
    Item(#[from] ItemError),

    /// The socket or framing layer failed mid-handler. Always fatal.
    #[error(transparent)]
    Transport(#[from] ragol_proto::TransportError),

    /// Anything else. Kept or dropped per `catch_handler_exceptions`.
    #[error("handler error: {0}")]
    Runtime(String),
}

impl HandlerError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::UnknownCommand { .. } => "unknown_command",
            Self::Malformed(_) => "malformed",
            Self::Disconnect(_) => "disconnect",
            Self::Account(e) => e.error_code(),
            Self::Lobby(e) => e.error_code(),
            Self::Item(e) => e.error_code(),
            Self::Transport(_) => "transport",
            Self::Runtime(_) => "runtime",
        }
    }

    /// Whether this error must tear the connection down even when
    /// `catch_handler_exceptions` is enabled.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::Disconnect(_) | Self::Transport(_)
        )
    }
}

/// Result type for command handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Errors raised by the lobby registry and membership operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LobbyError {
    #[error("no such lobby")]
    NotFound,

    #[error("lobby is full")]
    Full,

    #[error("version not allowed in this lobby")]
    VersionNotAllowed,

    #[error("incorrect password")]
    IncorrectPassword,

    #[error("level requirement not satisfied")]
    LevelRequirement,

    #[error("a quest is already in progress")]
    QuestInProgress,
}

impl LobbyError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound => "lobby_not_found",
            Self::Full => "lobby_full",
            Self::VersionNotAllowed => "version_not_allowed",
            Self::IncorrectPassword => "incorrect_password",
            Self::LevelRequirement => "level_requirement",
            Self::QuestInProgress => "quest_in_progress",
        }
    }
}

/// Errors raised by the floor item manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("no such item")]
    NotFound,

    #[error("too many items on the floor")]
    TooManyItems,
}

impl ItemError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound => "item_not_found",
            Self::TooManyItems => "too_many_items",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_error_codes() {
        assert_eq!(AccountError::MissingAccount.error_code(), "missing_account");
        assert_eq!(AccountError::AccountBanned.error_code(), "account_banned");
    }

    #[test]
    fn handler_error_fatality() {
        assert!(HandlerError::Disconnect("bye".into()).is_fatal());
        assert!(!HandlerError::PreconditionFailed("no".into()).is_fatal());
        assert!(!HandlerError::Runtime("oops".into()).is_fatal());
    }

    #[test]
    fn nested_codes_pass_through() {
        let err = HandlerError::Item(ItemError::TooManyItems);
        assert_eq!(err.error_code(), "too_many_items");
    }
}
