use thiserror::Error;
use url::Url;

/// Path of the chat function relative to the backend root.
const CHAT_FUNCTION_PATH: &str = "functions/v1/chat";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} is not a valid URL: {source}")]
    InvalidUrl {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
}

/// Endpoints and credential shared by the chat and backend clients.
///
/// Built once at startup from flags and environment, then passed to the
/// clients. Nothing below `main` reads the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend_url: Url,
    pub chat_url: Url,
    pub api_key: String,
}

impl Config {
    pub fn new(
        backend_url: Option<&str>,
        api_key: Option<&str>,
        chat_url: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let backend_url = backend_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("GALLERY_BACKEND_URL"))?;
        let api_key = api_key
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("GALLERY_PUBLISHABLE_KEY"))?;

        let backend_url = parse_url("GALLERY_BACKEND_URL", backend_url).map(with_trailing_slash)?;
        let chat_url = match chat_url.map(str::trim).filter(|s| !s.is_empty()) {
            Some(url) => parse_url("GALLERY_CHAT_URL", url)?,
            None => backend_url
                .join(CHAT_FUNCTION_PATH)
                .map_err(|source| ConfigError::InvalidUrl {
                    name: "GALLERY_BACKEND_URL",
                    source,
                })?,
        };

        Ok(Self {
            backend_url,
            chat_url,
            api_key: api_key.to_string(),
        })
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl { name, source })
}

// `Url::join` replaces the last segment unless the base ends in '/'.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
