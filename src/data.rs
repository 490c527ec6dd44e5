use crate::error::Error;
use crate::models::{AudioFeatures, Device, RecentPlay, TrackRecord, UserProfile};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use datafusion::arrow::array::{
    BooleanBuilder, Date32Builder, Float64Builder, Int32Builder, Int64Builder, RecordBatch,
    StringBuilder, TimestampMillisecondBuilder,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use datafusion::logical_expr::SortExpr;
use datafusion::prelude::{cast, col, DataFrame, Expr, SessionContext};
use log::warn;
use std::sync::Arc;

pub const UNKNOWN: &str = "unknown";

/// The star-schema tables of the warehouse, in load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    DimTrack,
    DimArtist,
    DimAudioFeatures,
    DimUser,
    DimDate,
    FactStreamingEvents,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::DimTrack,
        Table::DimArtist,
        Table::DimAudioFeatures,
        Table::DimUser,
        Table::DimDate,
        Table::FactStreamingEvents,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::DimTrack => "dim_track",
            Table::DimArtist => "dim_artist",
            Table::DimAudioFeatures => "dim_audio_features",
            Table::DimUser => "dim_user",
            Table::DimDate => "dim_date",
            Table::FactStreamingEvents => "fact_streaming_events",
        }
    }

    /// Natural key for dimensions, event id for the fact table.
    pub fn key(&self) -> &'static str {
        match self {
            Table::DimTrack | Table::DimAudioFeatures => "track_id",
            Table::DimArtist => "artist_id",
            Table::DimUser => "user_id",
            Table::DimDate => "date_key",
            Table::FactStreamingEvents => "event_id",
        }
    }

    pub fn is_fact(&self) -> bool {
        matches!(self, Table::FactStreamingEvents)
    }

    pub fn schema(&self) -> SchemaRef {
        match self {
            Table::DimTrack => dim_track_schema(),
            Table::DimArtist => dim_artist_schema(),
            Table::DimAudioFeatures => dim_audio_features_schema(),
            Table::DimUser => dim_user_schema(),
            Table::DimDate => dim_date_schema(),
            Table::FactStreamingEvents => fact_streaming_events_schema(),
        }
    }

    /// Hive partition columns; always the trailing columns of [`Table::schema`].
    pub fn partition_columns(&self) -> Vec<(String, DataType)> {
        match self {
            Table::FactStreamingEvents => vec![
                ("year".to_string(), DataType::Int32),
                ("genre".to_string(), DataType::Utf8),
                ("sentiment_score".to_string(), DataType::Int32),
            ],
            _ => vec![],
        }
    }

    /// Columns stored inside the Parquet files, i.e. without partition columns.
    pub fn file_schema(&self) -> SchemaRef {
        let partitions = self.partition_columns();
        let schema = self.schema();
        let fields: Vec<Field> = schema
            .fields()
            .iter()
            .filter(|f| !partitions.iter().any(|(name, _)| name == f.name()))
            .map(|f| f.as_ref().clone())
            .collect();
        Arc::new(Schema::new(fields))
    }
}

fn nullable(name: &str, data_type: DataType) -> Field {
    Field::new(name, data_type, true)
}

pub fn dim_track_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("track_id", DataType::Utf8),
        nullable("track_name", DataType::Utf8),
        nullable("artist_id", DataType::Utf8),
        nullable("artist_name", DataType::Utf8),
        nullable("album_id", DataType::Utf8),
        nullable("album_name", DataType::Utf8),
        nullable("genre", DataType::Utf8),
        nullable("mood_tag", DataType::Utf8),
        nullable("release_date", DataType::Date32),
        nullable("duration_ms", DataType::Int64),
        nullable("popularity", DataType::Int32),
    ]))
}

pub fn dim_artist_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("artist_id", DataType::Utf8),
        nullable("artist_name", DataType::Utf8),
        nullable("genre", DataType::Utf8),
        nullable("popularity", DataType::Float64),
        nullable("track_count", DataType::Int64),
    ]))
}

pub fn dim_audio_features_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("track_id", DataType::Utf8),
        nullable("danceability", DataType::Float64),
        nullable("energy", DataType::Float64),
        nullable("valence", DataType::Float64),
        nullable("tempo", DataType::Float64),
        nullable("loudness", DataType::Float64),
        nullable("acousticness", DataType::Float64),
        nullable("instrumentalness", DataType::Float64),
        nullable("speechiness", DataType::Float64),
        nullable("liveness", DataType::Float64),
        nullable("tempo_scaled", DataType::Float64),
        nullable("loudness_scaled", DataType::Float64),
        nullable("sentiment_score", DataType::Int32),
        nullable("mood_category", DataType::Utf8),
    ]))
}

pub fn dim_user_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("user_id", DataType::Utf8),
        nullable("display_name", DataType::Utf8),
        nullable("country", DataType::Utf8),
        nullable("product", DataType::Utf8),
        nullable("platform", DataType::Utf8),
    ]))
}

pub fn dim_date_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("date_key", DataType::Int32),
        nullable("date", DataType::Date32),
        nullable("year", DataType::Int32),
        nullable("quarter", DataType::Int32),
        nullable("month", DataType::Int32),
        nullable("day", DataType::Int32),
        nullable("day_of_week", DataType::Int32),
    ]))
}

pub fn fact_streaming_events_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("event_id", DataType::Utf8),
        nullable("track_id", DataType::Utf8),
        nullable("user_id", DataType::Utf8),
        nullable("date_key", DataType::Int32),
        nullable(
            "played_at",
            DataType::Timestamp(TimeUnit::Millisecond, None),
        ),
        nullable("platform", DataType::Utf8),
        nullable("context_type", DataType::Utf8),
        nullable("duration_ms", DataType::Int64),
        nullable("shuffle", DataType::Boolean),
        nullable("skipped", DataType::Boolean),
        nullable("year", DataType::Int32),
        nullable("genre", DataType::Utf8),
        nullable("sentiment_score", DataType::Int32),
    ]))
}

/// Track observations from every source, one row per observation.
pub fn raw_tracks_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("track_id", DataType::Utf8),
        nullable("track_name", DataType::Utf8),
        nullable("artist_id", DataType::Utf8),
        nullable("artist_name", DataType::Utf8),
        nullable("album_id", DataType::Utf8),
        nullable("album_name", DataType::Utf8),
        nullable("release_date", DataType::Date32),
        nullable("duration_ms", DataType::Int64),
        nullable("popularity", DataType::Int32),
        Field::new("is_local", DataType::Boolean, false),
    ]))
}

/// One row per credited artist of each observed track.
pub fn raw_track_artists_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("track_id", DataType::Utf8),
        nullable("artist_id", DataType::Utf8),
        nullable("artist_name", DataType::Utf8),
        nullable("popularity", DataType::Int32),
        Field::new("is_local", DataType::Boolean, false),
    ]))
}

pub fn raw_plays_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("event_id", DataType::Utf8),
        nullable("track_id", DataType::Utf8),
        nullable("user_id", DataType::Utf8),
        nullable(
            "played_at",
            DataType::Timestamp(TimeUnit::Millisecond, None),
        ),
        nullable("platform", DataType::Utf8),
        nullable("context_type", DataType::Utf8),
        nullable("duration_ms", DataType::Int64),
        nullable("shuffle", DataType::Boolean),
        nullable("skipped", DataType::Boolean),
    ]))
}

pub fn raw_audio_features_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("track_id", DataType::Utf8),
        nullable("danceability", DataType::Float64),
        nullable("energy", DataType::Float64),
        nullable("valence", DataType::Float64),
        nullable("tempo", DataType::Float64),
        nullable("loudness", DataType::Float64),
        nullable("acousticness", DataType::Float64),
        nullable("instrumentalness", DataType::Float64),
        nullable("speechiness", DataType::Float64),
        nullable("liveness", DataType::Float64),
    ]))
}

pub fn reference_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        nullable("artist_id", DataType::Utf8),
        nullable("genre", DataType::Utf8),
        nullable("mood_tag", DataType::Utf8),
    ]))
}

/// Converts track observations to a DataFrame, coercing types on the way.
///
/// # Arguments
/// * `tracks` - Tracks from saved, playlist and recently played items
/// * `ctx` - A reference to the [`SessionContext`] for DataFrame operations
///
/// # Returns
/// A Result containing either a [`DataFrame`] with [`raw_tracks_schema`] or an [`Error`]
pub fn tracks_to_df(tracks: &[&TrackRecord], ctx: &SessionContext) -> Result<DataFrame, Error> {
    let num_entries = tracks.len();

    let mut track_id_builder = StringBuilder::new();
    let mut track_name_builder = StringBuilder::new();
    let mut artist_id_builder = StringBuilder::new();
    let mut artist_name_builder = StringBuilder::new();
    let mut album_id_builder = StringBuilder::new();
    let mut album_name_builder = StringBuilder::new();
    let mut release_date_builder = Date32Builder::with_capacity(num_entries);
    let mut duration_builder = Int64Builder::with_capacity(num_entries);
    let mut popularity_builder = Int32Builder::with_capacity(num_entries);
    let mut is_local_builder = BooleanBuilder::with_capacity(num_entries);

    for track in tracks {
        let artist_names: Vec<String> = track
            .artist_names
            .iter()
            .filter_map(|name| normalize_text(Some(name)))
            .collect();

        track_id_builder.append_option(normalize_text(track.track_id.as_deref()));
        track_name_builder.append_option(normalize_text(track.track_name.as_deref()));
        artist_id_builder.append_option(normalize_text(
            track.artist_ids.first().map(String::as_str),
        ));
        artist_name_builder
            .append_option((!artist_names.is_empty()).then(|| artist_names.join(", ")));
        album_id_builder.append_option(normalize_text(track.album_id.as_deref()));
        album_name_builder.append_option(normalize_text(track.album_name.as_deref()));
        release_date_builder.append_option(
            track
                .release_date
                .as_deref()
                .and_then(parse_release_date),
        );
        duration_builder.append_option(track.duration_ms.filter(|ms| *ms >= 0));
        popularity_builder.append_option(track.popularity);
        is_local_builder.append_value(track.is_local);
    }

    let batch = RecordBatch::try_new(
        raw_tracks_schema(),
        vec![
            Arc::new(track_id_builder.finish()),
            Arc::new(track_name_builder.finish()),
            Arc::new(artist_id_builder.finish()),
            Arc::new(artist_name_builder.finish()),
            Arc::new(album_id_builder.finish()),
            Arc::new(album_name_builder.finish()),
            Arc::new(release_date_builder.finish()),
            Arc::new(duration_builder.finish()),
            Arc::new(popularity_builder.finish()),
            Arc::new(is_local_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

/// Explodes each observed track into one row per credited artist.
pub fn track_artists_to_df(
    tracks: &[&TrackRecord],
    ctx: &SessionContext,
) -> Result<DataFrame, Error> {
    let mut track_id_builder = StringBuilder::new();
    let mut artist_id_builder = StringBuilder::new();
    let mut artist_name_builder = StringBuilder::new();
    let mut popularity_builder = Int32Builder::new();
    let mut is_local_builder = BooleanBuilder::new();

    for track in tracks {
        let track_id = normalize_text(track.track_id.as_deref());
        for (artist_id, artist_name) in track.artist_ids.iter().zip(track.artist_names.iter()) {
            track_id_builder.append_option(track_id.as_deref());
            artist_id_builder.append_option(normalize_text(Some(artist_id)));
            artist_name_builder.append_option(normalize_text(Some(artist_name)));
            popularity_builder.append_option(track.popularity);
            is_local_builder.append_value(track.is_local);
        }
    }

    let batch = RecordBatch::try_new(
        raw_track_artists_schema(),
        vec![
            Arc::new(track_id_builder.finish()),
            Arc::new(artist_id_builder.finish()),
            Arc::new(artist_name_builder.finish()),
            Arc::new(popularity_builder.finish()),
            Arc::new(is_local_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

/// Converts recently played items to play events of `user_id`.
///
/// The event id is the composite `user_id:track_id:played_at_ms`; it stays
/// null when any part is missing so that cleaning drops the row.
pub fn plays_to_df(
    plays: &[RecentPlay],
    user_id: &str,
    platform: &str,
    ctx: &SessionContext,
) -> Result<DataFrame, Error> {
    let num_entries = plays.len();

    let mut event_id_builder = StringBuilder::new();
    let mut track_id_builder = StringBuilder::new();
    let mut user_id_builder = StringBuilder::new();
    let mut played_at_builder = TimestampMillisecondBuilder::with_capacity(num_entries);
    let mut platform_builder = StringBuilder::new();
    let mut context_type_builder = StringBuilder::new();
    let mut duration_builder = Int64Builder::with_capacity(num_entries);
    let mut shuffle_builder = BooleanBuilder::with_capacity(num_entries);
    let mut skipped_builder = BooleanBuilder::with_capacity(num_entries);

    let user_id = normalize_text(Some(user_id));

    for play in plays {
        let track_id = normalize_text(play.track.track_id.as_deref());
        let played_at = play.played_at.as_deref().and_then(parse_timestamp_ms);

        let event_id = match (&user_id, &track_id, played_at) {
            (Some(user), Some(track), Some(ms)) => Some(format!("{}:{}:{}", user, track, ms)),
            _ => None,
        };

        event_id_builder.append_option(event_id);
        track_id_builder.append_option(track_id);
        user_id_builder.append_option(user_id.as_deref());
        played_at_builder.append_option(played_at);
        platform_builder.append_value(platform);
        context_type_builder.append_option(normalize_text(play.context_type.as_deref()));
        duration_builder.append_option(play.track.duration_ms.filter(|ms| *ms >= 0));
        // The recently played endpoint reports neither shuffle state nor skips.
        shuffle_builder.append_null();
        skipped_builder.append_null();
    }

    let batch = RecordBatch::try_new(
        raw_plays_schema(),
        vec![
            Arc::new(event_id_builder.finish()),
            Arc::new(track_id_builder.finish()),
            Arc::new(user_id_builder.finish()),
            Arc::new(played_at_builder.finish()),
            Arc::new(platform_builder.finish()),
            Arc::new(context_type_builder.finish()),
            Arc::new(duration_builder.finish()),
            Arc::new(shuffle_builder.finish()),
            Arc::new(skipped_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

pub fn audio_features_to_df(
    features: &[AudioFeatures],
    ctx: &SessionContext,
) -> Result<DataFrame, Error> {
    let num_entries = features.len();

    let mut track_id_builder = StringBuilder::new();
    let mut float_builders: Vec<Float64Builder> = (0..9)
        .map(|_| Float64Builder::with_capacity(num_entries))
        .collect();

    for feature in features {
        track_id_builder.append_option(normalize_text(feature.track_id.as_deref()));
        let values = [
            feature.danceability,
            feature.energy,
            feature.valence,
            feature.tempo,
            feature.loudness,
            feature.acousticness,
            feature.instrumentalness,
            feature.speechiness,
            feature.liveness,
        ];
        for (builder, value) in float_builders.iter_mut().zip(values) {
            builder.append_option(value.filter(|v| v.is_finite()));
        }
    }

    let mut columns: Vec<datafusion::arrow::array::ArrayRef> =
        vec![Arc::new(track_id_builder.finish())];
    columns.extend(
        float_builders
            .iter_mut()
            .map(|builder| Arc::new(builder.finish()) as datafusion::arrow::array::ArrayRef),
    );

    let batch = RecordBatch::try_new(raw_audio_features_schema(), columns)?;
    Ok(ctx.read_batch(batch)?)
}

/// The single `dim_user` row of the extracted user.
pub fn user_to_df(
    user: &UserProfile,
    platform: &str,
    ctx: &SessionContext,
) -> Result<DataFrame, Error> {
    let mut user_id_builder = StringBuilder::new();
    let mut display_name_builder = StringBuilder::new();
    let mut country_builder = StringBuilder::new();
    let mut product_builder = StringBuilder::new();
    let mut platform_builder = StringBuilder::new();

    user_id_builder.append_option(normalize_text(Some(&user.user_id)));
    display_name_builder.append_option(normalize_text(user.display_name.as_deref()));
    country_builder.append_option(normalize_text(user.country.as_deref()));
    product_builder.append_option(normalize_text(user.product.as_deref()));
    platform_builder.append_value(platform);

    let batch = RecordBatch::try_new(
        dim_user_schema(),
        vec![
            Arc::new(user_id_builder.finish()),
            Arc::new(display_name_builder.finish()),
            Arc::new(country_builder.finish()),
            Arc::new(product_builder.finish()),
            Arc::new(platform_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

/// Device type of the active device, else of the first device, lower-cased.
pub fn user_platform(devices: &[Device]) -> String {
    devices
        .iter()
        .find(|device| device.is_active)
        .or_else(|| devices.first())
        .and_then(|device| normalize_text(device.device_type.as_deref()))
        .map(|kind| kind.to_lowercase())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

pub fn empty_df(ctx: &SessionContext, schema: SchemaRef) -> Result<DataFrame, Error> {
    Ok(ctx.read_batch(RecordBatch::new_empty(schema))?)
}

/// Selects exactly the columns of `schema`, in order, cast to its types.
pub fn conform(df: DataFrame, schema: &Schema) -> Result<DataFrame, Error> {
    let exprs: Vec<Expr> = schema
        .fields()
        .iter()
        .map(|field| cast(col(field.name()), field.data_type().clone()).alias(field.name()))
        .collect();
    Ok(df.select(exprs)?)
}

/// Keeps one row per key, the first according to `tie_break`.
pub fn keep_one_per_key(
    df: DataFrame,
    keys: &[&str],
    tie_break: SortExpr,
) -> Result<DataFrame, Error> {
    let columns: Vec<Expr> = df
        .schema()
        .fields()
        .iter()
        .map(|field| col(field.name()))
        .collect();
    let on: Vec<Expr> = keys.iter().map(|key| col(*key)).collect();
    let mut sort: Vec<SortExpr> = keys.iter().map(|key| col(*key).sort(true, false)).collect();
    sort.push(tie_break);

    Ok(df.distinct_on(on, columns, Some(sort))?)
}

/// Trims text; blank values become null.
pub fn normalize_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parses an RFC 3339 timestamp to milliseconds since the epoch.
pub fn parse_timestamp_ms(value: &str) -> Option<i64> {
    match DateTime::parse_from_rfc3339(value.trim()) {
        Ok(timestamp) => Some(timestamp.timestamp_millis()),
        Err(err) => {
            warn!("dropping malformed timestamp '{}': {}", value, err);
            None
        }
    }
}

/// Parses a release date of `year`, `month` or `day` precision to days since
/// the epoch. Coarser dates resolve to the first day of the period.
pub fn parse_release_date(date: &str) -> Option<i32> {
    let parts = date
        .trim()
        .split('-')
        .map(|part| part.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .ok();

    let parsed = match parts.as_deref() {
        Some(&[year]) => NaiveDate::from_ymd_opt(year as i32, 1, 1),
        Some(&[year, month]) => NaiveDate::from_ymd_opt(year as i32, month, 1),
        Some(&[year, month, day]) => NaiveDate::from_ymd_opt(year as i32, month, day),
        _ => None,
    };

    match parsed {
        Some(date) => Some((date - NaiveDateTime::UNIX_EPOCH.date()).num_days() as i32),
        None => {
            warn!("dropping malformed release date '{}'", date);
            None
        }
    }
}
