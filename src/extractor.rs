use crate::api_client::SpotifyApi;
use crate::error::Error;
use crate::models::{PlaylistTrack, TrackRecord};
use crate::staging::{Dataset, DatasetEntry, Manifest, StagedBatch, StagingArea};
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashSet;

/// Outcome of one extraction run.
#[derive(Debug)]
pub struct ExtractionReport {
    pub batch: StagedBatch,
    pub manifest: Manifest,
}

impl ExtractionReport {
    pub fn is_complete(&self) -> bool {
        self.manifest.failed().is_empty()
    }
}

/// Fetches every entity type for the authenticated user and stages it.
///
/// The profile request doubles as the authentication check and aborts the
/// run; failures of individual entity types are logged, recorded in the
/// manifest and do not stop the other fetches.
pub async fn extract<A: SpotifyApi + ?Sized>(
    api: &A,
    staging: &StagingArea,
    recently_played_limit: u8,
) -> Result<ExtractionReport, Error> {
    let user = api.current_user().await?;
    info!(
        "authenticated as {} ({})",
        user.display_name.as_deref().unwrap_or("<no display name>"),
        user.user_id
    );

    let extracted_at = Utc::now();
    let batch = staging.begin_batch(extracted_at)?;
    batch.write(Dataset::UserProfile, &user)?;
    let mut entries = vec![batch.entry(Dataset::UserProfile, 1, None)];

    info!("fetching saved tracks");
    let saved = api.saved_tracks().await;
    let saved_tracks: Vec<TrackRecord> = saved
        .as_ref()
        .map(|items| items.iter().map(|s| s.track.clone()).collect())
        .unwrap_or_default();
    entries.push(stage(&batch, Dataset::SavedTracks, saved)?);

    info!("fetching user playlists");
    let playlists = api.playlists().await;
    let playlist_ids: Vec<String> = playlists
        .as_ref()
        .map(|items| items.iter().map(|p| p.playlist_id.clone()).collect())
        .unwrap_or_default();
    entries.push(stage(&batch, Dataset::Playlists, playlists)?);

    let playlist_tracks = fetch_playlist_tracks(api, &playlist_ids).await;
    let playlist_track_records: Vec<TrackRecord> = playlist_tracks
        .items
        .iter()
        .map(|p| p.track.clone())
        .collect();
    entries.push(stage(&batch, Dataset::PlaylistTracks, playlist_tracks)?);

    info!("fetching recently played tracks");
    let recent = api.recently_played(recently_played_limit).await;
    let recent_tracks: Vec<TrackRecord> = recent
        .as_ref()
        .map(|items| items.iter().map(|r| r.track.clone()).collect())
        .unwrap_or_default();
    entries.push(stage(&batch, Dataset::RecentlyPlayed, recent)?);

    let track_ids = feature_track_ids(
        saved_tracks
            .iter()
            .chain(playlist_track_records.iter())
            .chain(recent_tracks.iter()),
    );
    info!("fetching audio features for {} tracks", track_ids.len());
    let features = if track_ids.is_empty() {
        Ok(Vec::new())
    } else {
        api.audio_features(&track_ids).await
    };
    entries.push(stage(&batch, Dataset::AudioFeatures, features)?);

    info!("fetching devices");
    let devices = api.devices().await;
    entries.push(stage(&batch, Dataset::Devices, devices)?);

    let manifest = Manifest {
        batch_id: batch.id().to_string(),
        extracted_at,
        user_id: user.user_id,
        datasets: entries,
    };
    batch.write_manifest(&manifest)?;

    info!("extraction complete, data saved in '{}'", batch.dir().display());
    Ok(ExtractionReport { batch, manifest })
}

/// Fetches the items of every playlist. A failing playlist does not discard
/// the items already fetched for the others, but marks the dataset failed.
async fn fetch_playlist_tracks<A: SpotifyApi + ?Sized>(
    api: &A,
    playlist_ids: &[String],
) -> PartialResult<PlaylistTrack> {
    let mut items = Vec::new();
    let mut failures = Vec::new();

    for playlist_id in playlist_ids {
        info!("fetching tracks for playlist {}", playlist_id);
        match api.playlist_tracks(playlist_id).await {
            Ok(tracks) => items.extend(tracks),
            Err(err) => {
                warn!("error fetching tracks for playlist {}: {}", playlist_id, err);
                failures.push(format!("{}: {}", playlist_id, err));
            }
        }
    }

    PartialResult { items, failures }
}

/// Unique ids of non-local tracks, in first-seen order.
fn feature_track_ids<'a>(tracks: impl Iterator<Item = &'a TrackRecord>) -> Vec<String> {
    let mut seen = HashSet::new();
    tracks
        .filter(|track| !track.is_local)
        .filter_map(|track| track.track_id.clone())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

struct PartialResult<T> {
    items: Vec<T>,
    failures: Vec<String>,
}

trait Stageable {
    type Item: Serialize;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl<T: Serialize> Stageable for Result<Vec<T>, Error> {
    type Item = T;
    fn into_parts(self) -> (Vec<T>, Option<String>) {
        match self {
            Ok(items) => (items, None),
            Err(err) => (Vec::new(), Some(err.to_string())),
        }
    }
}

impl<T: Serialize> Stageable for PartialResult<T> {
    type Item = T;
    fn into_parts(self) -> (Vec<T>, Option<String>) {
        let error = (!self.failures.is_empty()).then(|| self.failures.join("; "));
        (self.items, error)
    }
}

/// Writes whatever was fetched and records the outcome. Only staging I/O
/// errors propagate.
fn stage<S: Stageable>(
    batch: &StagedBatch,
    dataset: Dataset,
    fetched: S,
) -> Result<DatasetEntry, Error> {
    let (items, failure) = fetched.into_parts();

    if let Some(err) = &failure {
        error!("error fetching {}: {}", dataset.file_prefix(), err);
    }
    if failure.is_none() || !items.is_empty() {
        batch.write(dataset, &items)?;
        info!("fetched {} {}", items.len(), dataset.file_prefix());
    }

    Ok(batch.entry(dataset, items.len(), failure))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::MockSpotifyApi;
    use crate::models::{AudioFeatures, PlaylistRecord, RecentPlay, SavedTrack, UserProfile};
    use reqwest::StatusCode;
    use tempfile::TempDir;

    fn track(id: &str, is_local: bool) -> TrackRecord {
        TrackRecord {
            track_id: Some(id.to_string()),
            track_name: Some(format!("Song {}", id)),
            artist_ids: vec!["a1".to_string()],
            artist_names: vec!["Artist".to_string()],
            is_local,
            ..Default::default()
        }
    }

    fn api_failure() -> Error {
        Error::UnexpectedStatus {
            url: "https://api.spotify.com/v1/me/playlists".to_string(),
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn mock_with_user() -> MockSpotifyApi {
        let mut api = MockSpotifyApi::new();
        api.expect_current_user().returning(|| {
            Ok(UserProfile {
                user_id: "user_1".to_string(),
                display_name: Some("Listener".to_string()),
                ..Default::default()
            })
        });
        api
    }

    #[test]
    fn test_feature_track_ids_unique_and_non_local() {
        let tracks = vec![track("t1", false), track("t2", true), track("t1", false), track("t3", false)];
        assert_eq!(feature_track_ids(tracks.iter()), vec!["t1", "t3"]);
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_before_staging() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path());
        let mut api = MockSpotifyApi::new();
        api.expect_current_user()
            .returning(|| Err(Error::Authentication("bad token".to_string())));
        api.expect_saved_tracks().never();

        let result = extract(&api, &staging, 50).await;
        assert!(matches!(result.unwrap_err(), Error::Authentication(_)));
        assert!(!temp_dir.path().read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn test_entity_failure_is_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path());
        let mut api = mock_with_user();

        api.expect_saved_tracks().returning(|| {
            Ok(vec![SavedTrack {
                added_at: Some("2024-01-01T00:00:00Z".to_string()),
                track: track("t1", false),
            }])
        });
        api.expect_playlists().returning(|| Err(api_failure()));
        api.expect_playlist_tracks().never();
        api.expect_recently_played().returning(|limit| {
            assert_eq!(limit, 50);
            Ok(vec![RecentPlay {
                played_at: Some("2024-03-01T10:00:00Z".to_string()),
                track: track("t2", false),
                ..Default::default()
            }])
        });
        api.expect_audio_features().returning(|ids| {
            assert_eq!(ids, ["t1".to_string(), "t2".to_string()]);
            Ok(ids
                .iter()
                .map(|id| AudioFeatures {
                    track_id: Some(id.clone()),
                    valence: Some(0.5),
                    energy: Some(0.5),
                    ..Default::default()
                })
                .collect())
        });
        api.expect_devices().returning(|| Ok(vec![]));

        let report = extract(&api, &staging, 50).await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.manifest.failed(), vec![Dataset::Playlists]);
        assert_eq!(report.manifest.user_id, "user_1");

        let features: Vec<AudioFeatures> = report.batch.read(Dataset::AudioFeatures).unwrap();
        assert_eq!(features.len(), 2);
        assert!(!report.batch.dir().join("user_playlists.json").exists());

        let latest = staging.latest_batch().unwrap();
        assert_eq!(latest.id(), report.batch.id());
    }

    #[tokio::test]
    async fn test_failing_playlist_keeps_other_playlists() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingArea::new(temp_dir.path());
        let mut api = mock_with_user();

        api.expect_saved_tracks().returning(|| Ok(vec![]));
        api.expect_playlists().returning(|| {
            Ok(vec![
                PlaylistRecord {
                    playlist_id: "p1".to_string(),
                    ..Default::default()
                },
                PlaylistRecord {
                    playlist_id: "p2".to_string(),
                    ..Default::default()
                },
            ])
        });
        api.expect_playlist_tracks().returning(|playlist_id| {
            if playlist_id == "p1" {
                Ok(vec![PlaylistTrack {
                    playlist_id: "p1".to_string(),
                    track: track("t7", false),
                    ..Default::default()
                }])
            } else {
                Err(api_failure())
            }
        });
        api.expect_recently_played().returning(|_| Ok(vec![]));
        api.expect_audio_features()
            .returning(|ids| {
                assert_eq!(ids, ["t7".to_string()]);
                Ok(vec![])
            });
        api.expect_devices().returning(|| Ok(vec![]));

        let report = extract(&api, &staging, 50).await.unwrap();

        assert_eq!(report.manifest.failed(), vec![Dataset::PlaylistTracks]);
        let staged: Vec<PlaylistTrack> = report.batch.read(Dataset::PlaylistTracks).unwrap();
        assert_eq!(staged.len(), 1);
    }
}
