//! Player identity captured from the handshake packet.

use crate::packets::{ClientType, Connect};
use std::fmt;
use uuid::Uuid;

/// Who a session belongs to.
///
/// Built once from the client's `Connect` and never mutated. Before the
/// handshake arrives a session carries [`PlayerIdentity::unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayerIdentity {
    pub uuid: Option<Uuid>,
    pub username: Option<String>,
    pub protocol_hash: Option<String>,
    pub identity_token: Option<String>,
    pub language: Option<String>,
    pub client_type: Option<ClientType>,
}

impl PlayerIdentity {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn from_connect(connect: &Connect) -> Self {
        Self {
            uuid: Some(connect.uuid),
            username: Some(connect.username.clone()),
            protocol_hash: Some(connect.protocol_hash.clone()),
            identity_token: connect.identity_token.clone(),
            language: connect.language.clone(),
            client_type: Some(connect.client_type),
        }
    }

    /// Both uuid and username are set.
    pub fn is_known(&self) -> bool {
        self.uuid.is_some() && self.username.is_some()
    }

    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("<unknown>")
    }

    /// Parsed locale, falling back to English for absent or malformed codes.
    pub fn locale(&self) -> Locale {
        self.language
            .as_deref()
            .and_then(Locale::parse)
            .unwrap_or_default()
    }

    pub fn client_kind(&self) -> ClientKind {
        match self.client_type {
            Some(ClientType::Game) => ClientKind::Game,
            Some(ClientType::Editor) => ClientKind::Editor,
            None => ClientKind::Unknown,
        }
    }
}

impl fmt::Display for PlayerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uuid {
            Some(uuid) => write!(f, "{} ({uuid})", self.display_name()),
            None => f.write_str(self.display_name()),
        }
    }
}

/// Client flavour as seen by event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Game,
    Editor,
    Unknown,
}

/// A language tag split into its parts, e.g. `de-DE` or `en_US`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale {
    pub language: String,
    pub country: Option<String>,
    pub variant: Option<String>,
}

impl Locale {
    /// Parse `en`, `en-US`, `en_US` or `en_US_variant`.
    ///
    /// Returns `None` for blank input or parts that are not alphanumeric.
    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim();
        if code.is_empty() {
            return None;
        }
        let normalized = code.replace('-', "_");
        let mut parts = normalized.splitn(3, '_');
        let language = parts.next().filter(|p| is_tag(p))?.to_ascii_lowercase();
        let country = match parts.next() {
            Some(p) if is_tag(p) => Some(p.to_ascii_uppercase()),
            Some(_) => return None,
            None => None,
        };
        let variant = match parts.next() {
            Some(p) if !p.is_empty() => Some(p.to_string()),
            Some(_) => return None,
            None => None,
        };
        Some(Self {
            language,
            country,
            variant,
        })
    }

    /// `language-COUNTRY` form.
    pub fn tag(&self) -> String {
        match &self.country {
            Some(country) => format!("{}-{}", self.language, country),
            None => self.language.clone(),
        }
    }
}

impl Default for Locale {
    fn default() -> Self {
        Self {
            language: "en".into(),
            country: None,
            variant: None,
        }
    }
}

fn is_tag(part: &str) -> bool {
    !part.is_empty() && part.len() <= 8 && part.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(language: Option<&str>) -> Connect {
        Connect {
            protocol_hash: "abc".into(),
            client_type: ClientType::Editor,
            uuid: Uuid::from_u128(42),
            language: language.map(String::from),
            identity_token: Some("id-token".into()),
            username: "Steve".into(),
            ..Default::default()
        }
    }

    #[test]
    fn unknown_identity() {
        let id = PlayerIdentity::unknown();
        assert!(!id.is_known());
        assert_eq!(id.display_name(), "<unknown>");
        assert_eq!(id.client_kind(), ClientKind::Unknown);
    }

    #[test]
    fn from_connect_copies_fields() {
        let id = PlayerIdentity::from_connect(&connect(Some("de-DE")));
        assert!(id.is_known());
        assert_eq!(id.uuid, Some(Uuid::from_u128(42)));
        assert_eq!(id.identity_token.as_deref(), Some("id-token"));
        assert_eq!(id.client_kind(), ClientKind::Editor);
        assert_eq!(id.locale().tag(), "de-DE");
    }

    #[test]
    fn locale_accepts_underscore_and_case() {
        let locale = Locale::parse("EN_us").unwrap();
        assert_eq!(locale.language, "en");
        assert_eq!(locale.country.as_deref(), Some("US"));

        let locale = Locale::parse("ca_ES_valencia").unwrap();
        assert_eq!(locale.variant.as_deref(), Some("valencia"));
    }

    #[test]
    fn absent_or_malformed_language_falls_back() {
        for language in [None, Some(""), Some("   "), Some("??"), Some("en-!!"), Some("en--")] {
            let id = PlayerIdentity::from_connect(&connect(language));
            assert_eq!(id.locale(), Locale::default(), "input {language:?}");
        }
        assert_eq!(Locale::default().tag(), "en");
    }
}
