use crate::config::Config;
use crate::credentials::{Credentials, Grant};
use crate::error::Error;
use crate::models::{
    AudioFeatures, Device, PlaylistRecord, PlaylistTrack, RecentPlay, SavedTrack, TrackRecord,
    UserProfile,
};
use log::{debug, info, warn};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const SAVED_TRACKS_PAGE_SIZE: &str = "50";
const PLAYLISTS_PAGE_SIZE: &str = "50";
const PLAYLIST_ITEMS_PAGE_SIZE: &str = "100";
/// The audio-features endpoint accepts at most 100 ids per call.
pub const AUDIO_FEATURES_BATCH_SIZE: usize = 100;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SpotifyApi: Send + Sync + 'static {
    /// Fetches the profile of the authenticated user.
    async fn current_user(&self) -> Result<UserProfile, Error>;

    /// Fetches every track in the user's library, following pagination.
    async fn saved_tracks(&self) -> Result<Vec<SavedTrack>, Error>;

    /// Fetches every playlist owned or followed by the user.
    async fn playlists(&self) -> Result<Vec<PlaylistRecord>, Error>;

    /// Fetches the items of one playlist. Items without a track are skipped.
    /// # Arguments
    /// * `playlist_id` - The Spotify id of the playlist.
    async fn playlist_tracks(&self, playlist_id: &str) -> Result<Vec<PlaylistTrack>, Error>;

    /// Fetches the most recent plays; the API keeps no more than 50.
    async fn recently_played(&self, limit: u8) -> Result<Vec<RecentPlay>, Error>;

    /// Fetches audio features for the given track ids, in batches of
    /// [`AUDIO_FEATURES_BATCH_SIZE`]. Ids the API does not know are dropped.
    async fn audio_features(&self, track_ids: &[String]) -> Result<Vec<AudioFeatures>, Error>;

    /// Fetches the devices currently known for the user.
    async fn devices(&self) -> Result<Vec<Device>, Error>;
}

/// Backoff settings for retryable responses.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    access_token: String,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct Paging<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

#[derive(Deserialize)]
struct ArtistObject {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct AlbumObject {
    id: Option<String>,
    name: Option<String>,
    release_date: Option<String>,
    release_date_precision: Option<String>,
}

#[derive(Deserialize)]
struct TrackObject {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    artists: Vec<ArtistObject>,
    album: Option<AlbumObject>,
    duration_ms: Option<i64>,
    popularity: Option<i32>,
    external_urls: Option<ExternalUrls>,
    preview_url: Option<String>,
    #[serde(default)]
    is_local: bool,
}

#[derive(Deserialize)]
struct SavedTrackItem {
    added_at: Option<String>,
    track: TrackObject,
}

#[derive(Deserialize)]
struct UserObject {
    id: String,
    display_name: Option<String>,
    country: Option<String>,
    product: Option<String>,
}

#[derive(Deserialize)]
struct OwnerObject {
    id: Option<String>,
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct PlaylistTracksRef {
    total: u32,
}

#[derive(Deserialize)]
struct PlaylistObject {
    id: String,
    name: Option<String>,
    owner: Option<OwnerObject>,
    description: Option<String>,
    public: Option<bool>,
    #[serde(default)]
    collaborative: bool,
    tracks: Option<PlaylistTracksRef>,
    snapshot_id: Option<String>,
    external_urls: Option<ExternalUrls>,
}

#[derive(Deserialize)]
struct AddedBy {
    id: Option<String>,
}

#[derive(Deserialize)]
struct PlaylistItem {
    added_at: Option<String>,
    added_by: Option<AddedBy>,
    track: Option<TrackObject>,
}

#[derive(Deserialize)]
struct PlayContext {
    #[serde(rename = "type")]
    context_type: Option<String>,
    uri: Option<String>,
}

#[derive(Deserialize)]
struct PlayHistoryItem {
    played_at: Option<String>,
    track: TrackObject,
    context: Option<PlayContext>,
}

#[derive(Deserialize)]
struct AudioFeaturesResponse {
    audio_features: Vec<Option<AudioFeatures>>,
}

#[derive(Deserialize)]
struct DeviceObject {
    id: Option<String>,
    name: Option<String>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    is_active: bool,
}

#[derive(Deserialize)]
struct Devices {
    devices: Vec<DeviceObject>,
}

impl From<TrackObject> for TrackRecord {
    fn from(track: TrackObject) -> Self {
        let (album_id, album_name, release_date, release_date_precision) = match track.album {
            Some(album) => (
                album.id,
                album.name,
                album.release_date,
                album.release_date_precision,
            ),
            None => (None, None, None, None),
        };

        TrackRecord {
            track_id: track.id,
            track_name: track.name,
            artist_ids: track.artists.iter().filter_map(|a| a.id.clone()).collect(),
            artist_names: track
                .artists
                .iter()
                .filter_map(|a| a.name.clone())
                .collect(),
            album_id,
            album_name,
            release_date,
            release_date_precision,
            duration_ms: track.duration_ms,
            popularity: track.popularity,
            external_url: track.external_urls.and_then(|u| u.spotify),
            preview_url: track.preview_url,
            is_local: track.is_local,
        }
    }
}

impl ApiClient {
    pub fn new(config: &Config, access_token: String) -> Self {
        ApiClient {
            client: Client::new(),
            base_url: config.api_url.to_string(),
            access_token,
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Exchanges the configured grant for an access token at the accounts
    /// service. Called once per run.
    pub async fn authenticate(config: &Config, credentials: &Credentials) -> Result<Self, Error> {
        let grant = credentials.require_grant()?;

        let mut url = Url::parse(&config.accounts_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(&["api", "token"]);

        let redirect_uri = credentials.redirect_uri.to_string();
        let form: Vec<(&str, &str)> = match grant {
            Grant::RefreshToken(token) => {
                vec![("grant_type", "refresh_token"), ("refresh_token", token.as_str())]
            }
            Grant::AuthorizationCode(code) => vec![
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
            ],
        };

        let resp = Client::new()
            .post(url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication(format!(
                "token endpoint responded with {}: {}",
                status, body
            )));
        }

        let token = resp.json::<TokenResponse>().await?;
        info!(
            "obtained access token (expires in {}s)",
            token.expires_in.unwrap_or_default()
        );

        Ok(ApiClient::new(config, token.access_token))
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send_with_retry(&self, url: &Url) -> Result<Response, Error> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .get(url.clone())
                .bearer_auth(&self.access_token)
                .send()
                .await;

            let delay = match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                    return Err(Error::Authentication(format!(
                        "access token rejected by {}",
                        url
                    )));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable || attempt >= self.retry.max_retries {
                        return Err(Error::UnexpectedStatus {
                            url: url.to_string(),
                            status,
                        });
                    }
                    retry_after(&resp).unwrap_or_else(|| self.retry.backoff(attempt))
                }
                Err(err) if (err.is_connect() || err.is_timeout())
                    && attempt < self.retry.max_retries =>
                {
                    self.retry.backoff(attempt)
                }
                Err(err) => return Err(err.into()),
            };

            attempt += 1;
            warn!(
                "request to {} failed, retry {}/{} in {:?}",
                url, attempt, self.retry.max_retries, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, Error> {
        let resp = self.send_with_retry(url).await?;
        Ok(resp.json::<T>().await?)
    }

    /// Follows `next` links until the last page.
    async fn get_all_pages<T: DeserializeOwned>(&self, first: Url) -> Result<Vec<T>, Error> {
        let mut page: Paging<T> = self.get_json(&first).await?;
        let mut items = std::mem::take(&mut page.items);

        while let Some(next) = page.next.take() {
            debug!("fetching next page {}", next);
            page = self.get_json(&Url::parse(&next)?).await?;
            items.append(&mut page.items);
        }

        Ok(items)
    }
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait::async_trait]
impl SpotifyApi for ApiClient {
    async fn current_user(&self) -> Result<UserProfile, Error> {
        let user: UserObject = self.get_json(&self.endpoint(&["me"], &[])?).await?;

        Ok(UserProfile {
            user_id: user.id,
            display_name: user.display_name,
            country: user.country,
            product: user.product,
        })
    }

    async fn saved_tracks(&self) -> Result<Vec<SavedTrack>, Error> {
        let url = self.endpoint(&["me", "tracks"], &[("limit", SAVED_TRACKS_PAGE_SIZE)])?;
        let items: Vec<SavedTrackItem> = self.get_all_pages(url).await?;

        Ok(items
            .into_iter()
            .map(|item| SavedTrack {
                added_at: item.added_at,
                track: item.track.into(),
            })
            .collect())
    }

    async fn playlists(&self) -> Result<Vec<PlaylistRecord>, Error> {
        let url = self.endpoint(&["me", "playlists"], &[("limit", PLAYLISTS_PAGE_SIZE)])?;
        let playlists: Vec<PlaylistObject> = self.get_all_pages(url).await?;

        Ok(playlists
            .into_iter()
            .map(|playlist| {
                let (owner_id, owner_name) = match playlist.owner {
                    Some(owner) => (owner.id, owner.display_name),
                    None => (None, None),
                };
                PlaylistRecord {
                    playlist_id: playlist.id,
                    playlist_name: playlist.name,
                    owner_id,
                    owner_name,
                    description: playlist.description,
                    public: playlist.public,
                    collaborative: playlist.collaborative,
                    track_count: playlist.tracks.map(|t| t.total).unwrap_or_default(),
                    snapshot_id: playlist.snapshot_id,
                    external_url: playlist.external_urls.and_then(|u| u.spotify),
                }
            })
            .collect())
    }

    async fn playlist_tracks(&self, playlist_id: &str) -> Result<Vec<PlaylistTrack>, Error> {
        let url = self.endpoint(
            &["playlists", playlist_id, "tracks"],
            &[("limit", PLAYLIST_ITEMS_PAGE_SIZE)],
        )?;
        let items: Vec<Option<PlaylistItem>> = self.get_all_pages(url).await?;

        Ok(items
            .into_iter()
            .flatten()
            .filter_map(|item| {
                let track = item.track?;
                Some(PlaylistTrack {
                    playlist_id: playlist_id.to_string(),
                    added_at: item.added_at,
                    added_by_id: item.added_by.and_then(|a| a.id),
                    track: track.into(),
                })
            })
            .collect())
    }

    async fn recently_played(&self, limit: u8) -> Result<Vec<RecentPlay>, Error> {
        let limit = limit.to_string();
        let url = self.endpoint(&["me", "player", "recently-played"], &[("limit", &limit)])?;
        // Cursor-paginated; a single page already covers the retained history.
        let page: Paging<PlayHistoryItem> = self.get_json(&url).await?;

        Ok(page
            .items
            .into_iter()
            .map(|item| {
                let (context_type, context_uri) = match item.context {
                    Some(context) => (context.context_type, context.uri),
                    None => (None, None),
                };
                RecentPlay {
                    played_at: item.played_at,
                    track: item.track.into(),
                    context_type,
                    context_uri,
                }
            })
            .collect())
    }

    async fn audio_features(&self, track_ids: &[String]) -> Result<Vec<AudioFeatures>, Error> {
        let mut features = Vec::with_capacity(track_ids.len());

        for batch in track_ids.chunks(AUDIO_FEATURES_BATCH_SIZE) {
            let ids = batch.join(",");
            let url = self.endpoint(&["audio-features"], &[("ids", &ids)])?;
            let response: AudioFeaturesResponse = self.get_json(&url).await?;
            features.extend(response.audio_features.into_iter().flatten());
        }

        Ok(features)
    }

    async fn devices(&self) -> Result<Vec<Device>, Error> {
        let url = self.endpoint(&["me", "player", "devices"], &[])?;
        let response: Devices = self.get_json(&url).await?;

        Ok(response
            .devices
            .into_iter()
            .map(|device| Device {
                device_id: device.id,
                name: device.name,
                device_type: device.device_type,
                is_active: device.is_active,
            })
            .collect())
    }
}
