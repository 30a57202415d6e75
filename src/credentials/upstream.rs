use secrecy::{ExposeSecret, SecretString};
use url::Url;

/// Username/token pair used for HTTPS pushes to the Git hosting side.
#[derive(Debug)]
pub struct PushCredential {
    username: String,
    token: SecretString,
}

impl PushCredential {
    pub fn new(username: String, token: SecretString) -> Self {
        Self { username, token }
    }

    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    /// Embed the credential into an HTTPS clone URL.
    ///
    /// The result must never be logged; pass it through [`redact`] first.
    pub fn authenticated_url(&self, http_url: &str) -> Result<String, url::ParseError> {
        let mut url = Url::parse(http_url)?;
        // set_username/set_password only fail for cannot-be-a-base URLs,
        // which Url::parse does not produce for http(s).
        let _ = url.set_username(&self.username);
        let _ = url.set_password(Some(self.token.expose_secret()));
        Ok(url.to_string())
    }

    /// Replace every occurrence of the token in `text`.
    pub fn redact(&self, text: &str) -> String {
        redact(text, self.token.expose_secret())
    }
}

/// Replace `secret` in `text` with a fixed marker.
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "***")
}
