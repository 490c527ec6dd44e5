//! Records written to and read back from the staging area.
//!
//! Fields that the API may omit are `Option`s so that the cleaning step, not
//! deserialization, decides what a usable record is.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub country: Option<String>,
    pub product: Option<String>,
}

/// Track attributes shared by saved, playlist and recently played items.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TrackRecord {
    pub track_id: Option<String>,
    pub track_name: Option<String>,
    pub artist_ids: Vec<String>,
    pub artist_names: Vec<String>,
    pub album_id: Option<String>,
    pub album_name: Option<String>,
    pub release_date: Option<String>,
    pub release_date_precision: Option<String>,
    pub duration_ms: Option<i64>,
    pub popularity: Option<i32>,
    pub external_url: Option<String>,
    pub preview_url: Option<String>,
    #[serde(default)]
    pub is_local: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SavedTrack {
    pub added_at: Option<String>,
    #[serde(flatten)]
    pub track: TrackRecord,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PlaylistRecord {
    pub playlist_id: String,
    pub playlist_name: Option<String>,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub description: Option<String>,
    pub public: Option<bool>,
    pub collaborative: bool,
    pub track_count: u32,
    pub snapshot_id: Option<String>,
    pub external_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PlaylistTrack {
    pub playlist_id: String,
    pub added_at: Option<String>,
    pub added_by_id: Option<String>,
    #[serde(flatten)]
    pub track: TrackRecord,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RecentPlay {
    pub played_at: Option<String>,
    #[serde(flatten)]
    pub track: TrackRecord,
    pub context_type: Option<String>,
    pub context_uri: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AudioFeatures {
    #[serde(alias = "id")]
    pub track_id: Option<String>,
    pub danceability: Option<f64>,
    pub energy: Option<f64>,
    pub key: Option<i32>,
    pub loudness: Option<f64>,
    pub mode: Option<i32>,
    pub speechiness: Option<f64>,
    pub acousticness: Option<f64>,
    pub instrumentalness: Option<f64>,
    pub liveness: Option<f64>,
    pub valence: Option<f64>,
    pub tempo: Option<f64>,
    pub duration_ms: Option<i64>,
    pub time_signature: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Device {
    pub device_id: Option<String>,
    pub name: Option<String>,
    pub device_type: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}
