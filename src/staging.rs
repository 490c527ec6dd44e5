//! Local staging area: one directory per extraction run holding a JSON file
//! per dataset and a manifest written last.

use crate::error::Error;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const BATCH_PREFIX: &str = "batch_";
const MANIFEST_FILE: &str = "manifest.json";
const TRANSFORMED_DIR: &str = "transformed";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    UserProfile,
    SavedTracks,
    Playlists,
    PlaylistTracks,
    RecentlyPlayed,
    AudioFeatures,
    Devices,
}

impl Dataset {
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Dataset::UserProfile => "user_profile",
            Dataset::SavedTracks => "saved_tracks",
            Dataset::Playlists => "user_playlists",
            Dataset::PlaylistTracks => "playlist_tracks",
            Dataset::RecentlyPlayed => "recently_played",
            Dataset::AudioFeatures => "saved_tracks_audio_features",
            Dataset::Devices => "devices",
        }
    }

    fn file_name(&self) -> String {
        format!("{}.json", self.file_prefix())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatasetEntry {
    pub dataset: Dataset,
    pub file: Option<String>,
    pub records: usize,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    pub batch_id: String,
    pub extracted_at: DateTime<Utc>,
    pub user_id: String,
    pub datasets: Vec<DatasetEntry>,
}

impl Manifest {
    pub fn failed(&self) -> Vec<Dataset> {
        self.datasets
            .iter()
            .filter(|entry| entry.error.is_some())
            .map(|entry| entry.dataset)
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StagingArea { root: root.into() }
    }

    /// Creates the directory for a new batch named after its start time.
    pub fn begin_batch(&self, started_at: DateTime<Utc>) -> Result<StagedBatch, Error> {
        fs::create_dir_all(&self.root)?;

        let base = format!("{}{}", BATCH_PREFIX, started_at.format("%Y%m%d_%H%M%S"));
        let mut id = base.clone();
        let mut suffix = 1;
        while self.root.join(&id).exists() {
            id = format!("{}_{}", base, suffix);
            suffix += 1;
        }

        let dir = self.root.join(&id);
        fs::create_dir(&dir)?;
        info!("staging batch {} at {}", id, dir.display());

        Ok(StagedBatch { id, dir })
    }

    /// Opens a batch by id. Only batches with a manifest are complete.
    pub fn open_batch(&self, id: &str) -> Result<StagedBatch, Error> {
        let dir = self.root.join(id);
        if !dir.join(MANIFEST_FILE).is_file() {
            return Err(Error::StagingBatchNotFound {
                location: dir.display().to_string(),
            });
        }
        Ok(StagedBatch {
            id: id.to_string(),
            dir,
        })
    }

    /// The newest complete batch.
    pub fn latest_batch(&self) -> Result<StagedBatch, Error> {
        let not_found = || Error::StagingBatchNotFound {
            location: self.root.display().to_string(),
        };

        if !self.root.is_dir() {
            return Err(not_found());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(BATCH_PREFIX) && entry.path().join(MANIFEST_FILE).is_file() {
                ids.push(name);
            }
        }

        ids.sort();
        let id = ids.pop().ok_or_else(not_found)?;
        self.open_batch(&id)
    }

    pub fn resolve(&self, id: Option<&str>) -> Result<StagedBatch, Error> {
        match id {
            Some(id) => self.open_batch(id),
            None => self.latest_batch(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StagedBatch {
    id: String,
    dir: PathBuf,
}

impl StagedBatch {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn transformed_dir(&self) -> PathBuf {
        self.dir.join(TRANSFORMED_DIR)
    }

    /// Writes a dataset as pretty JSON. The file appears atomically.
    pub fn write<T: Serialize + ?Sized>(&self, dataset: Dataset, data: &T) -> Result<PathBuf, Error> {
        let path = self.dir.join(dataset.file_name());
        write_json_atomic(&path, data)?;
        info!("data saved to {}", path.display());
        Ok(path)
    }

    /// Reads a list dataset. A dataset that was never staged reads as empty.
    pub fn read<T: DeserializeOwned>(&self, dataset: Dataset) -> Result<Vec<T>, Error> {
        let path = self.dir.join(dataset.file_name());
        if !path.is_file() {
            warn!(
                "dataset {} missing from batch {}, treating as empty",
                dataset.file_prefix(),
                self.id
            );
            return Ok(Vec::new());
        }
        read_json(&path)
    }

    pub fn read_one<T: DeserializeOwned>(&self, dataset: Dataset) -> Result<T, Error> {
        let path = self.dir.join(dataset.file_name());
        if !path.is_file() {
            return Err(Error::StagingBatchNotFound {
                location: path.display().to_string(),
            });
        }
        read_json(&path)
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<(), Error> {
        write_json_atomic(&self.dir.join(MANIFEST_FILE), manifest)
    }

    pub fn manifest(&self) -> Result<Manifest, Error> {
        read_json(&self.dir.join(MANIFEST_FILE))
    }

    pub fn entry(&self, dataset: Dataset, records: usize, error: Option<String>) -> DatasetEntry {
        DatasetEntry {
            dataset,
            file: error.is_none().then(|| dataset.file_name()),
            records,
            error,
        }
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<(), Error> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, data)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let reader = BufReader::new(fs::File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
