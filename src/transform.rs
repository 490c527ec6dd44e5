use crate::data::{self, conform, empty_df, keep_one_per_key, Table, UNKNOWN};
use crate::error::Error;
use crate::models::{
    AudioFeatures, Device, PlaylistTrack, RecentPlay, SavedTrack, TrackRecord, UserProfile,
};
use crate::staging::{Dataset, StagedBatch};
use datafusion::arrow::array::Array;
use datafusion::arrow::datatypes::DataType;
use datafusion::common::cast::as_float64_array;
use datafusion::common::{JoinType, ScalarValue};
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::functions_aggregate::expr_fn::{avg, count, max, min};
use datafusion::prelude::{
    cast, col, date_part, lit, when, DataFrame, Expr, ParquetReadOptions, SessionContext,
};
use log::{info, warn};
use std::fs;
use std::path::Path;

pub const MOOD_THRESHOLD: f64 = 0.5;
pub const UNSCORED: i32 = -1;

/// Everything staged for one batch, read back from JSON.
#[derive(Debug, Default)]
pub struct StagedRecords {
    pub user: UserProfile,
    pub saved_tracks: Vec<SavedTrack>,
    pub playlist_tracks: Vec<PlaylistTrack>,
    pub recently_played: Vec<RecentPlay>,
    pub audio_features: Vec<AudioFeatures>,
    pub devices: Vec<Device>,
}

impl StagedRecords {
    pub fn read(batch: &StagedBatch) -> Result<Self, Error> {
        Ok(StagedRecords {
            user: batch.read_one(Dataset::UserProfile)?,
            saved_tracks: batch.read(Dataset::SavedTracks)?,
            playlist_tracks: batch.read(Dataset::PlaylistTracks)?,
            recently_played: batch.read(Dataset::RecentlyPlayed)?,
            audio_features: batch.read(Dataset::AudioFeatures)?,
            devices: batch.read(Dataset::Devices)?,
        })
    }

    /// Track observations of every source.
    fn tracks(&self) -> Vec<&TrackRecord> {
        self.saved_tracks
            .iter()
            .map(|saved| &saved.track)
            .chain(self.playlist_tracks.iter().map(|item| &item.track))
            .chain(self.recently_played.iter().map(|play| &play.track))
            .collect()
    }
}

/// The cleaned star-schema tables of one batch, conformed to [`Table::schema`].
pub struct TransformedTables {
    tables: Vec<(Table, DataFrame)>,
}

impl TransformedTables {
    pub fn get(&self, table: Table) -> Option<&DataFrame> {
        self.tables
            .iter()
            .find(|(candidate, _)| *candidate == table)
            .map(|(_, df)| df)
    }

    /// Tables in load order, dimensions first.
    pub fn into_tables(self) -> Vec<(Table, DataFrame)> {
        self.tables
    }

    /// Writes one Parquet file per table, replacing earlier output.
    pub async fn write(&self, dir: &Path) -> Result<(), Error> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;

        for (table, df) in &self.tables {
            let path = dir.join(format!("{}.parquet", table.name()));
            df.clone()
                .write_parquet(
                    &path.to_string_lossy(),
                    DataFrameWriteOptions::new().with_single_file_output(true),
                    None,
                )
                .await?;
            info!("wrote {} to {}", table.name(), path.display());
        }

        Ok(())
    }

    /// Reads the output of [`TransformedTables::write`].
    pub async fn read(ctx: &SessionContext, dir: &Path) -> Result<Self, Error> {
        if !dir.is_dir() {
            return Err(Error::NoData {
                message: format!("no transformed data at '{}'", dir.display()),
            });
        }

        let mut tables = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            let schema = table.schema();
            let path = dir.join(format!("{}.parquet", table.name()));

            let df = if path.is_file() {
                let df = ctx
                    .read_parquet(
                        path.to_string_lossy().to_string(),
                        ParquetReadOptions::default().schema(&schema),
                    )
                    .await?;
                conform(df, &schema)?
            } else {
                warn!("{} has no transformed rows", table.name());
                empty_df(ctx, schema)?
            };
            tables.push((table, df));
        }

        Ok(TransformedTables { tables })
    }
}

/// Turns one staged batch into the star-schema tables.
///
/// # Arguments
/// * `ctx` - A reference to the [`SessionContext`] for DataFrame operations
/// * `records` - The staged batch contents
/// * `reference` - Artist genre and mood reference, see [`crate::reference_loader`]
///
/// # Returns
/// A Result containing either the [`TransformedTables`] or an [`Error`]
pub async fn transform(
    ctx: &SessionContext,
    records: &StagedRecords,
    reference: DataFrame,
) -> Result<TransformedTables, Error> {
    let platform = data::user_platform(&records.devices);
    let observations = records.tracks();

    let tracks = clean_tracks(data::tracks_to_df(&observations, ctx)?)?
        .cache()
        .await?;
    let track_count = tracks.clone().count().await?;
    if track_count == 0 {
        return Err(Error::NoData {
            message: "No valid tracks found in staged batch".to_string(),
        });
    }
    info!("{} unique tracks after cleaning", track_count);

    let tracks = enrich_tracks(tracks, reference.clone())?.cache().await?;
    let artists = build_artists(
        data::track_artists_to_df(&observations, ctx)?,
        tracks.clone(),
        reference,
    )?;

    let features =
        clean_audio_features(data::audio_features_to_df(&records.audio_features, ctx)?)?;
    let features = scale_features(derive_mood(features)?).await?.cache().await?;

    let plays = clean_plays(data::plays_to_df(
        &records.recently_played,
        &records.user.user_id,
        &platform,
        ctx,
    )?)?;
    let facts = build_facts(plays, tracks.clone(), features.clone())
        .await?
        .cache()
        .await?;
    let dates = build_dates(facts.clone())?;
    let users = data::user_to_df(&records.user, &platform, ctx)?;

    let tables = vec![
        (Table::DimTrack, tracks),
        (Table::DimArtist, artists),
        (Table::DimAudioFeatures, features),
        (Table::DimUser, users),
        (Table::DimDate, dates),
        (Table::FactStreamingEvents, facts),
    ]
    .into_iter()
    .map(|(table, df)| Ok((table, conform(df, &table.schema())?)))
    .collect::<Result<Vec<_>, Error>>()?;

    Ok(TransformedTables { tables })
}

/// Drops tracks without id, name or primary artist, local files and
/// duplicates. The most popular observation of a track wins.
pub fn clean_tracks(df: DataFrame) -> Result<DataFrame, Error> {
    let df = df
        .filter(
            col("track_id")
                .is_not_null()
                .and(col("track_name").is_not_null())
                .and(col("artist_id").is_not_null())
                .and(col("is_local").not_eq(lit(true))),
        )?
        .distinct()?;

    keep_one_per_key(df, &["track_id"], col("popularity").sort(false, false))
}

pub fn clean_audio_features(df: DataFrame) -> Result<DataFrame, Error> {
    let df = df
        .filter(
            col("track_id")
                .is_not_null()
                .and(col("valence").between(lit(0.0), lit(1.0)))
                .and(col("energy").between(lit(0.0), lit(1.0))),
        )?
        .distinct()?;

    keep_one_per_key(df, &["track_id"], col("valence").sort(true, false))
}

pub fn clean_plays(df: DataFrame) -> Result<DataFrame, Error> {
    let df = df
        .filter(
            col("event_id")
                .is_not_null()
                .and(col("track_id").is_not_null())
                .and(col("played_at").is_not_null()),
        )?
        .distinct()?;

    keep_one_per_key(df, &["event_id"], col("played_at").sort(true, false))
}

pub fn mood_category_expr() -> Result<Expr, Error> {
    let positive = col("valence").gt_eq(lit(MOOD_THRESHOLD));
    let energetic = col("energy").gt_eq(lit(MOOD_THRESHOLD));

    Ok(
        when(col("valence").is_null().or(col("energy").is_null()), lit(UNKNOWN))
            .when(positive.clone().and(energetic.clone()), lit("happy"))
            .when(positive, lit("calm"))
            .when(energetic, lit("angry"))
            .otherwise(lit("sad"))?,
    )
}

/// Valence scaled to `0..=10`, truncated.
pub fn sentiment_score_expr() -> Expr {
    cast(col("valence") * lit(10.0), DataType::Int32)
}

pub fn derive_mood(features: DataFrame) -> Result<DataFrame, Error> {
    Ok(features
        .with_column("sentiment_score", sentiment_score_expr())?
        .with_column("mood_category", mood_category_expr()?)?)
}

pub async fn scale_features(features: DataFrame) -> Result<DataFrame, Error> {
    let tempo = min_max_scaled(&features, "tempo").await?;
    let loudness = min_max_scaled(&features, "loudness").await?;

    Ok(features
        .with_column("tempo_scaled", tempo)?
        .with_column("loudness_scaled", loudness)?)
}

/// Expression mapping `column` into `[0, 1]` over the batch's range.
async fn min_max_scaled(df: &DataFrame, column: &str) -> Result<Expr, Error> {
    let batches = df
        .clone()
        .aggregate(
            vec![],
            vec![
                min(col(column)).alias("lower"),
                max(col(column)).alias("upper"),
            ],
        )?
        .collect()
        .await?;

    let mut bounds = None;
    for batch in batches.iter().filter(|batch| batch.num_rows() > 0) {
        let lower = as_float64_array(batch.column(0))?;
        let upper = as_float64_array(batch.column(1))?;
        if !lower.is_null(0) && !upper.is_null(0) {
            bounds = Some((lower.value(0), upper.value(0)));
        }
    }

    Ok(match bounds {
        Some((lower, upper)) if upper > lower => {
            (col(column) - lit(lower)) / lit(upper - lower)
        }
        _ => when(col(column).is_null(), lit(ScalarValue::Float64(None))).otherwise(lit(0.0))?,
    })
}

/// Left join on the primary artist; unmatched tracks get genre `unknown`.
pub fn enrich_tracks(tracks: DataFrame, reference: DataFrame) -> Result<DataFrame, Error> {
    let reference = reference.select(vec![
        col("artist_id").alias("ref_artist_id"),
        col("genre"),
        col("mood_tag"),
    ])?;

    Ok(tracks
        .join(
            reference,
            JoinType::Left,
            &["artist_id"],
            &["ref_artist_id"],
            None,
        )?
        .drop_columns(&["ref_artist_id"])?
        .fill_null(ScalarValue::from(UNKNOWN), vec!["genre".to_string()])?)
}

/// One row per artist credited on a cleaned track of the batch.
pub fn build_artists(
    track_artists: DataFrame,
    tracks: DataFrame,
    reference: DataFrame,
) -> Result<DataFrame, Error> {
    let cleaned = tracks.select(vec![col("track_id").alias("clean_track_id")])?;
    let credits = track_artists
        .filter(col("artist_id").is_not_null())?
        .join(
            cleaned,
            JoinType::LeftSemi,
            &["track_id"],
            &["clean_track_id"],
            None,
        )?;
    let credits = keep_one_per_key(
        credits,
        &["track_id", "artist_id"],
        col("popularity").sort(false, false),
    )?;

    let artists = credits.aggregate(
        vec![col("artist_id").alias("artist_id")],
        vec![
            max(col("artist_name")).alias("artist_name"),
            avg(col("popularity")).alias("popularity"),
            count(col("track_id")).alias("track_count"),
        ],
    )?;

    let genres = reference.select(vec![col("artist_id").alias("ref_artist_id"), col("genre")])?;

    Ok(artists
        .join(genres, JoinType::Left, &["artist_id"], &["ref_artist_id"], None)?
        .drop_columns(&["ref_artist_id"])?
        .fill_null(ScalarValue::from(UNKNOWN), vec!["genre".to_string()])?)
}

fn date_field(date: Expr, part: &str) -> Expr {
    cast(date_part(lit(part), date), DataType::Int32)
}

/// `YYYYMMDD` as an integer.
fn date_key(date: Expr) -> Expr {
    date_field(date.clone(), "year") * lit(10_000)
        + date_field(date.clone(), "month") * lit(100)
        + date_field(date, "day")
}

/// Plays of tracks present in `tracks`, with their partition columns.
pub async fn build_facts(
    plays: DataFrame,
    tracks: DataFrame,
    features: DataFrame,
) -> Result<DataFrame, Error> {
    let track_genres = tracks.select(vec![col("track_id").alias("dim_track_id"), col("genre")])?;
    let scores = features.select(vec![
        col("track_id").alias("feature_track_id"),
        col("sentiment_score"),
    ])?;

    let play_count = plays.clone().count().await?;
    let played_on = cast(col("played_at"), DataType::Date32);

    let facts = plays
        .join(
            track_genres,
            JoinType::Inner,
            &["track_id"],
            &["dim_track_id"],
            None,
        )?
        .join(
            scores,
            JoinType::Left,
            &["track_id"],
            &["feature_track_id"],
            None,
        )?
        .drop_columns(&["dim_track_id", "feature_track_id"])?
        .fill_null(
            ScalarValue::Int32(Some(UNSCORED)),
            vec!["sentiment_score".to_string()],
        )?
        .with_column("date_key", date_key(played_on.clone()))?
        .with_column("year", date_field(played_on, "year"))?;

    let fact_count = facts.clone().count().await?;
    if fact_count < play_count {
        warn!(
            "dropped {} plays of tracks missing from dim_track",
            play_count - fact_count
        );
    }

    Ok(facts)
}

pub fn build_dates(facts: DataFrame) -> Result<DataFrame, Error> {
    let dates = facts
        .select(vec![cast(col("played_at"), DataType::Date32).alias("date")])?
        .distinct()?;

    Ok(dates.select(vec![
        date_key(col("date")).alias("date_key"),
        col("date"),
        date_field(col("date"), "year").alias("year"),
        date_field(col("date"), "quarter").alias("quarter"),
        date_field(col("date"), "month").alias("month"),
        date_field(col("date"), "day").alias("day"),
        date_field(col("date"), "dow").alias("day_of_week"),
    ])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::reference_schema;
    use datafusion::arrow::array::{Float64Array, RecordBatch, StringArray};
    use datafusion::common::cast::{as_int32_array, as_string_array};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn track(id: &str, artist: &str, popularity: i32) -> TrackRecord {
        TrackRecord {
            track_id: Some(id.to_string()),
            track_name: Some(format!("Song {}", id)),
            artist_ids: vec![artist.to_string()],
            artist_names: vec![format!("Artist {}", artist)],
            album_id: Some("album".to_string()),
            album_name: Some("Album".to_string()),
            release_date: Some("2021-06-01".to_string()),
            release_date_precision: Some("day".to_string()),
            duration_ms: Some(200_000),
            popularity: Some(popularity),
            ..Default::default()
        }
    }

    fn features(id: &str, valence: f64, energy: f64, tempo: f64) -> AudioFeatures {
        AudioFeatures {
            track_id: Some(id.to_string()),
            valence: Some(valence),
            energy: Some(energy),
            tempo: Some(tempo),
            loudness: Some(-5.0),
            ..Default::default()
        }
    }

    fn play(id: &str, artist: &str, played_at: &str) -> RecentPlay {
        RecentPlay {
            played_at: Some(played_at.to_string()),
            track: track(id, artist, 10),
            context_type: Some("playlist".to_string()),
            ..Default::default()
        }
    }

    fn records() -> StagedRecords {
        StagedRecords {
            user: UserProfile {
                user_id: "user_1".to_string(),
                display_name: Some("Listener".to_string()),
                country: Some("SE".to_string()),
                product: Some("premium".to_string()),
            },
            saved_tracks: vec![
                SavedTrack {
                    added_at: None,
                    track: track("t1", "a1", 60),
                },
                SavedTrack {
                    added_at: None,
                    track: track("t2", "a2", 40),
                },
            ],
            playlist_tracks: vec![PlaylistTrack {
                playlist_id: "p1".to_string(),
                track: track("t1", "a1", 61),
                ..Default::default()
            }],
            recently_played: vec![
                play("t1", "a1", "2024-03-01T10:00:00Z"),
                play("t1", "a1", "2024-03-01T10:00:00Z"),
                play("t3", "a1", "2024-03-02T11:30:00Z"),
            ],
            audio_features: vec![
                features("t1", 0.8, 0.9, 60.0),
                features("t2", 0.2, 0.1, 180.0),
            ],
            devices: vec![Device {
                device_type: Some("Smartphone".to_string()),
                is_active: true,
                ..Default::default()
            }],
        }
    }

    fn reference(ctx: &SessionContext) -> DataFrame {
        let batch = RecordBatch::try_new(
            reference_schema(),
            vec![
                Arc::new(StringArray::from(vec!["a1"])),
                Arc::new(StringArray::from(vec!["pop"])),
                Arc::new(StringArray::from(vec!["upbeat"])),
            ],
        )
        .unwrap();
        ctx.read_batch(batch).unwrap()
    }

    async fn strings(df: DataFrame, column: &str) -> Vec<Option<String>> {
        let batches = df
            .select(vec![col(column)])
            .unwrap()
            .sort(vec![col(column).sort(true, false)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        let mut values = Vec::new();
        for batch in batches {
            let array = as_string_array(batch.column(0)).unwrap();
            for i in 0..array.len() {
                values.push((!array.is_null(i)).then(|| array.value(i).to_string()));
            }
        }
        values
    }

    #[tokio::test]
    async fn test_clean_tracks_drops_invalid_rows() {
        let ctx = SessionContext::new();
        let mut nameless = track("t2", "a1", 10);
        nameless.track_name = Some("   ".to_string());
        let mut local = track("t3", "a1", 10);
        local.is_local = true;
        let mut no_artist = track("t4", "a1", 10);
        no_artist.artist_ids.clear();
        let valid = track("t1", "a1", 10);

        let df = data::tracks_to_df(&[&valid, &nameless, &local, &no_artist, &valid], &ctx).unwrap();
        let cleaned = clean_tracks(df).unwrap();

        assert_eq!(strings(cleaned, "track_id").await, vec![Some("t1".to_string())]);
    }

    #[tokio::test]
    async fn test_clean_tracks_keeps_most_popular_observation() {
        let ctx = SessionContext::new();
        let first = track("t1", "a1", 10);
        let second = track("t1", "a1", 70);

        let df = data::tracks_to_df(&[&first, &second], &ctx).unwrap();
        let batches = clean_tracks(df)
            .unwrap()
            .select(vec![col("popularity")])
            .unwrap()
            .collect()
            .await
            .unwrap();

        let popularity = as_int32_array(batches[0].column(0)).unwrap();
        assert_eq!(popularity.len(), 1);
        assert_eq!(popularity.value(0), 70);
    }

    #[tokio::test]
    async fn test_cleaning_twice_matches_cleaning_once() {
        let ctx = SessionContext::new();
        let first = track("t1", "a1", 10);
        let second = track("t2", "a2", 20);
        let mut blank = track("t3", "a1", 10);
        blank.track_id = Some(" ".to_string());

        let raw = data::tracks_to_df(&[&first, &second, &first, &blank], &ctx).unwrap();
        let once = clean_tracks(raw).unwrap().cache().await.unwrap();
        let twice = clean_tracks(once.clone()).unwrap();

        assert_eq!(once.clone().count().await.unwrap(), 2);
        assert_eq!(
            strings(once, "track_id").await,
            strings(twice, "track_id").await
        );
    }

    #[tokio::test]
    async fn test_clean_audio_features_range_check() {
        let ctx = SessionContext::new();
        let rows = vec![
            features("t1", 0.5, 0.5, 100.0),
            features("t2", 1.5, 0.5, 100.0),
            AudioFeatures {
                track_id: Some("t3".to_string()),
                energy: Some(0.4),
                ..Default::default()
            },
        ];

        let df = data::audio_features_to_df(&rows, &ctx).unwrap();
        let cleaned = clean_audio_features(df).unwrap();
        assert_eq!(strings(cleaned, "track_id").await, vec![Some("t1".to_string())]);
    }

    #[tokio::test]
    async fn test_mood_category_is_deterministic() {
        let ctx = SessionContext::new();
        let cases = vec![
            (Some(0.5), Some(0.5), "happy"),
            (Some(0.9), Some(0.1), "calm"),
            (Some(0.1), Some(0.9), "angry"),
            (Some(0.49), Some(0.49), "sad"),
            (None, Some(0.9), UNKNOWN),
            (Some(0.9), None, UNKNOWN),
        ];

        let batch = RecordBatch::try_new(
            Arc::new(datafusion::arrow::datatypes::Schema::new(vec![
                datafusion::arrow::datatypes::Field::new("valence", DataType::Float64, true),
                datafusion::arrow::datatypes::Field::new("energy", DataType::Float64, true),
            ])),
            vec![
                Arc::new(Float64Array::from(cases.iter().map(|c| c.0).collect::<Vec<_>>())),
                Arc::new(Float64Array::from(cases.iter().map(|c| c.1).collect::<Vec<_>>())),
            ],
        )
        .unwrap();

        let batches = derive_mood(ctx.read_batch(batch).unwrap())
            .unwrap()
            .collect()
            .await
            .unwrap();
        let scores = as_int32_array(batches[0].column(2)).unwrap();
        let moods = as_string_array(batches[0].column(3)).unwrap();

        for (i, (_, _, expected)) in cases.iter().enumerate() {
            assert_eq!(moods.value(i), *expected, "row {}", i);
        }
        assert_eq!(scores.value(0), 5);
        assert_eq!(scores.value(1), 9);
        assert_eq!(scores.value(3), 4);
        assert!(scores.is_null(4));
    }

    #[tokio::test]
    async fn test_scale_features() {
        let ctx = SessionContext::new();
        let rows = vec![
            features("t1", 0.5, 0.5, 60.0),
            features("t2", 0.5, 0.5, 120.0),
            features("t3", 0.5, 0.5, 180.0),
        ];

        let df = data::audio_features_to_df(&rows, &ctx).unwrap();
        let batches = scale_features(df)
            .await
            .unwrap()
            .sort(vec![col("track_id").sort(true, false)])
            .unwrap()
            .select(vec![col("tempo_scaled"), col("loudness_scaled")])
            .unwrap()
            .collect()
            .await
            .unwrap();

        let tempo = as_float64_array(batches[0].column(0)).unwrap();
        let loudness = as_float64_array(batches[0].column(1)).unwrap();
        assert_eq!(tempo.values().to_vec(), vec![0.0, 0.5, 1.0]);
        // A single distinct loudness scales to zero.
        assert_eq!(loudness.values().to_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_enrichment_keeps_unmatched_tracks() {
        let ctx = SessionContext::new();
        let first = track("t1", "a1", 10);
        let second = track("t2", "a2", 10);

        let tracks = clean_tracks(data::tracks_to_df(&[&first, &second], &ctx).unwrap()).unwrap();
        let enriched = enrich_tracks(tracks, reference(&ctx)).unwrap();

        let batches = enriched
            .sort(vec![col("track_id").sort(true, false)])
            .unwrap()
            .select(vec![col("genre"), col("mood_tag")])
            .unwrap()
            .collect()
            .await
            .unwrap();
        let genres = as_string_array(batches[0].column(0)).unwrap();
        let moods = as_string_array(batches[0].column(1)).unwrap();
        assert_eq!(genres.len(), 2);
        assert_eq!(genres.value(0), "pop");
        assert_eq!(moods.value(0), "upbeat");
        assert_eq!(genres.value(1), UNKNOWN);
        assert!(moods.is_null(1));
    }

    #[tokio::test]
    async fn test_transform_builds_star_tables() {
        let ctx = SessionContext::new();
        let tables = transform(&ctx, &records(), reference(&ctx)).await.unwrap();

        let dim_track = tables.get(Table::DimTrack).unwrap().clone();
        assert_eq!(
            strings(dim_track, "track_id").await,
            vec![
                Some("t1".to_string()),
                Some("t2".to_string()),
                Some("t3".to_string())
            ]
        );

        let facts = tables.get(Table::FactStreamingEvents).unwrap().clone();
        let batches = facts
            .sort(vec![col("event_id").sort(true, false)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);
        let event_ids = as_string_array(batch.column(0)).unwrap();
        assert_eq!(event_ids.value(0), "user_1:t1:1709287200000");
        let date_keys = as_int32_array(batch.column(3)).unwrap();
        assert_eq!(date_keys.value(0), 20240301);
        let platforms = as_string_array(batch.column(5)).unwrap();
        assert_eq!(platforms.value(0), "smartphone");
        let scores = as_int32_array(batch.column(12)).unwrap();
        assert_eq!(scores.value(0), 8);
        assert_eq!(scores.value(1), UNSCORED);

        let dim_date = tables.get(Table::DimDate).unwrap().clone();
        assert_eq!(dim_date.count().await.unwrap(), 2);

        let dim_artist = tables.get(Table::DimArtist).unwrap().clone();
        let batches = dim_artist
            .sort(vec![col("artist_id").sort(true, false)])
            .unwrap()
            .collect()
            .await
            .unwrap();
        let track_counts = datafusion::common::cast::as_int64_array(batches[0].column(4)).unwrap();
        assert_eq!(track_counts.value(0), 2);
        assert_eq!(track_counts.value(1), 1);
    }

    #[tokio::test]
    async fn test_transform_is_idempotent() {
        let ctx = SessionContext::new();
        let first = transform(&ctx, &records(), reference(&ctx)).await.unwrap();
        let second = transform(&ctx, &records(), reference(&ctx)).await.unwrap();

        for table in [Table::DimTrack, Table::FactStreamingEvents] {
            let key = table.key();
            let left = strings(first.get(table).unwrap().clone(), key).await;
            let right = strings(second.get(table).unwrap().clone(), key).await;
            assert_eq!(left, right);
        }
    }

    #[tokio::test]
    async fn test_transform_without_tracks_fails() {
        let ctx = SessionContext::new();
        let records = StagedRecords {
            user: UserProfile {
                user_id: "user_1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = transform(&ctx, &records, reference(&ctx)).await;
        assert!(matches!(result, Err(Error::NoData { .. })));
    }

    #[tokio::test]
    async fn test_write_and_read_transformed() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("transformed");
        let ctx = SessionContext::new();

        let tables = transform(&ctx, &records(), reference(&ctx)).await.unwrap();
        tables.write(&dir).await.unwrap();
        assert!(dir.join("dim_track.parquet").is_file());

        let read = TransformedTables::read(&ctx, &dir).await.unwrap();
        let dim_track = read.get(Table::DimTrack).unwrap().clone();
        assert_eq!(dim_track.count().await.unwrap(), 3);

        let schema = read.get(Table::FactStreamingEvents).unwrap().schema().clone();
        assert_eq!(schema.fields().len(), Table::FactStreamingEvents.schema().fields().len());
    }
}
