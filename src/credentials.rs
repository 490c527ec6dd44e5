use crate::config::Config;
use crate::error::Error;
use url::Url;

/// Scopes covering every endpoint the extractor reads.
pub const SCOPE: &str = "user-read-private user-read-email user-library-read user-top-read \
user-read-recently-played playlist-read-private playlist-read-collaborative user-read-playback-state";

/// How the access token for this run is obtained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Grant {
    RefreshToken(String),
    AuthorizationCode(String),
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Url,
    pub grant: Option<Grant>,
}

impl Credentials {
    /// Reads the client credentials from the resolved configuration.
    ///
    /// Fails before any network call when the client id, client secret or
    /// redirect URI is missing or blank.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let client_id = required(&config.client_id, "SPOTIPY_CLIENT_ID")?;
        let client_secret = required(&config.client_secret, "SPOTIPY_CLIENT_SECRET")?;
        let redirect_uri = Url::parse(&required(&config.redirect_uri, "SPOTIPY_REDIRECT_URI")?)?;

        let grant = match (non_blank(&config.refresh_token), non_blank(&config.auth_code)) {
            (Some(token), _) => Some(Grant::RefreshToken(token)),
            (None, Some(code)) => Some(Grant::AuthorizationCode(code)),
            (None, None) => None,
        };

        Ok(Credentials {
            client_id,
            client_secret,
            redirect_uri,
            grant,
        })
    }

    /// The URL a user visits once to authorize the app and obtain a code.
    pub fn authorize_url(&self, accounts_url: &str) -> Result<Url, Error> {
        let mut url = Url::parse(accounts_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .push("authorize");
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("scope", SCOPE);
        Ok(url)
    }

    pub fn require_grant(&self) -> Result<&Grant, Error> {
        self.grant.as_ref().ok_or_else(|| {
            Error::Authentication(
                "neither SPOTIPY_REFRESH_TOKEN nor SPOTIPY_AUTH_CODE is set; \
                 visit the URL printed by `authorize-url` to obtain a code"
                    .to_string(),
            )
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(value: &Option<String>, variable: &'static str) -> Result<String, Error> {
    non_blank(value).ok_or(Error::MissingCredential { variable })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_credentials_from_complete_config() {
        let config = Config::for_tests(Path::new("/tmp"));
        let credentials = Credentials::from_config(&config).unwrap();

        assert_eq!(credentials.client_id, "test_client");
        assert_eq!(credentials.client_secret, "test_secret");
        assert_eq!(
            credentials.grant,
            Some(Grant::RefreshToken("test_refresh".to_string()))
        );
    }

    #[test]
    fn test_missing_client_id_fails() {
        let mut config = Config::for_tests(Path::new("/tmp"));
        config.client_id = None;

        let result = Credentials::from_config(&config);
        assert!(matches!(
            result.unwrap_err(),
            Error::MissingCredential { variable } if variable == "SPOTIPY_CLIENT_ID"
        ));
    }

    #[test]
    fn test_blank_secret_counts_as_missing() {
        let mut config = Config::for_tests(Path::new("/tmp"));
        config.client_secret = Some("   ".to_string());

        let result = Credentials::from_config(&config);
        assert!(matches!(
            result.unwrap_err(),
            Error::MissingCredential { variable } if variable == "SPOTIPY_CLIENT_SECRET"
        ));
    }

    #[test]
    fn test_invalid_redirect_uri() {
        let mut config = Config::for_tests(Path::new("/tmp"));
        config.redirect_uri = Some("not a url".to_string());

        let result = Credentials::from_config(&config);
        assert!(matches!(result.unwrap_err(), Error::UrlParsingFailed(_)));
    }

    #[test]
    fn test_auth_code_used_without_refresh_token() {
        let mut config = Config::for_tests(Path::new("/tmp"));
        config.refresh_token = None;
        config.auth_code = Some("abc".to_string());

        let credentials = Credentials::from_config(&config).unwrap();
        assert_eq!(
            credentials.grant,
            Some(Grant::AuthorizationCode("abc".to_string()))
        );
    }

    #[test]
    fn test_missing_grant_is_an_authentication_error() {
        let mut config = Config::for_tests(Path::new("/tmp"));
        config.refresh_token = None;

        let credentials = Credentials::from_config(&config).unwrap();
        assert!(matches!(
            credentials.require_grant().unwrap_err(),
            Error::Authentication(_)
        ));
    }

    #[test]
    fn test_authorize_url() {
        let config = Config::for_tests(Path::new("/tmp"));
        let credentials = Credentials::from_config(&config).unwrap();

        let url = credentials
            .authorize_url("https://accounts.spotify.com")
            .unwrap();
        assert_eq!(url.path(), "/authorize");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".to_string(), "test_client".to_string())));
        assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));
        assert!(pairs.contains(&("scope".to_string(), SCOPE.to_string())));
    }
}
