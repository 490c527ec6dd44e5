use clap::Args as ClapArgs;

const DEFAULT_API_URL: &str = "https://api.spotify.com/v1";
const DEFAULT_ACCOUNTS_URL: &str = "https://accounts.spotify.com";
const STAGING_DIR: &str = "./spotify_data";
const WAREHOUSE_DIR: &str = "./warehouse";
const REFERENCE_FILE_PATH: &str = "./reference/genre_tags.csv";

#[derive(ClapArgs, Clone, Debug)]
pub struct Config {
    #[arg(long, env = "SPOTIPY_CLIENT_ID", hide_env_values = true)]
    pub(crate) client_id: Option<String>,

    #[arg(long, env = "SPOTIPY_CLIENT_SECRET", hide_env_values = true)]
    pub(crate) client_secret: Option<String>,

    #[arg(long, env = "SPOTIPY_REDIRECT_URI")]
    pub(crate) redirect_uri: Option<String>,

    /// Refresh token from a previous authorization; preferred over an authorization code
    #[arg(long, env = "SPOTIPY_REFRESH_TOKEN", hide_env_values = true)]
    pub(crate) refresh_token: Option<String>,

    /// One-time code returned to the redirect URI after visiting `authorize-url`
    #[arg(long, env = "SPOTIPY_AUTH_CODE", hide_env_values = true)]
    pub(crate) auth_code: Option<String>,

    #[arg(long, default_value = DEFAULT_API_URL, env = "SPOTIFY_API_URL")]
    pub(crate) api_url: String,

    #[arg(long, default_value = DEFAULT_ACCOUNTS_URL, env = "SPOTIFY_ACCOUNTS_URL")]
    pub(crate) accounts_url: String,

    #[arg(long, default_value = STAGING_DIR, env = "STAGING_DIR")]
    pub(crate) staging_dir: String,

    #[arg(long, default_value = WAREHOUSE_DIR, env = "WAREHOUSE_DIR")]
    pub(crate) warehouse_dir: String,

    #[arg(long, default_value = REFERENCE_FILE_PATH, env = "REFERENCE_FILE_PATH")]
    pub(crate) reference_file_path: String,

    #[arg(long, default_value_t = 3, env = "MAX_RETRIES")]
    pub(crate) max_retries: u32,

    #[arg(long, default_value_t = 500, env = "RETRY_BASE_DELAY_MS")]
    pub(crate) retry_base_delay_ms: u64,

    /// The API only keeps the 50 most recent plays
    #[arg(
        long,
        default_value_t = 50,
        env = "RECENTLY_PLAYED_LIMIT",
        value_parser = clap::value_parser!(u8).range(1..=50)
    )]
    pub(crate) recently_played_limit: u8,
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_tests(root: &std::path::Path) -> Self {
        Config {
            client_id: Some("test_client".to_string()),
            client_secret: Some("test_secret".to_string()),
            redirect_uri: Some("http://127.0.0.1:8888/callback".to_string()),
            refresh_token: Some("test_refresh".to_string()),
            auth_code: None,
            api_url: DEFAULT_API_URL.to_string(),
            accounts_url: DEFAULT_ACCOUNTS_URL.to_string(),
            staging_dir: root.join("staging").to_string_lossy().into_owned(),
            warehouse_dir: root.join("warehouse").to_string_lossy().into_owned(),
            reference_file_path: root.join("genre_tags.csv").to_string_lossy().into_owned(),
            max_retries: 2,
            retry_base_delay_ms: 1,
            recently_played_limit: 50,
        }
    }
}
