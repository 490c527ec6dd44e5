use crate::config::Config;
use crate::data::{empty_df, keep_one_per_key, reference_schema};
use crate::error::Error;
use datafusion::prelude::{
    btrim, col, lit, lower, nullif, replace, CsvReadOptions, DataFrame, Expr, SessionContext,
};
use log::{info, warn};
use std::path::Path;

#[async_trait::async_trait]
pub trait ReferenceLoader: Send + Sync + 'static {
    /// Loads the artist genre and mood reference.
    ///
    /// # Arguments
    /// * `ctx` - The session context for the DataFrame operations.
    ///
    /// # Returns
    /// A Result containing either a DataFrame with one row per artist
    /// (`artist_id`, normalized `genre`, `mood_tag`) or an Error.
    async fn load(&self, ctx: &SessionContext) -> Result<DataFrame, Error>;
}

#[derive(Clone)]
pub struct CsvReferenceLoader {
    file_path: String,
}

impl CsvReferenceLoader {
    pub fn new(config: &Config) -> Self {
        CsvReferenceLoader {
            file_path: config.reference_file_path.clone(),
        }
    }
}

#[async_trait::async_trait]
impl ReferenceLoader for CsvReferenceLoader {
    async fn load(&self, ctx: &SessionContext) -> Result<DataFrame, Error> {
        let schema = reference_schema();

        if !Path::new(&self.file_path).is_file() {
            warn!(
                "reference file '{}' not found, genres default to unknown",
                self.file_path
            );
            return empty_df(ctx, schema);
        }

        let reference_df = ctx
            .read_csv(
                &self.file_path,
                CsvReadOptions::new().schema(&schema).has_header(true),
            )
            .await?;

        let reference_df = normalize_reference(reference_df)?;
        info!("loaded genre reference from '{}'", self.file_path);

        Ok(reference_df)
    }
}

/// Lower-cases and trims genres, joining words with underscores.
pub fn normalize_genre(genre: Expr) -> Expr {
    let genre = lower(btrim(vec![genre]));
    replace(replace(genre, lit(" "), lit("_")), lit("/"), lit("_"))
}

/// Trims the reference, drops rows without an artist or genre and keeps one
/// row per artist.
pub fn normalize_reference(df: DataFrame) -> Result<DataFrame, Error> {
    let df = df
        .select(vec![
            nullif(btrim(vec![col("artist_id")]), lit("")).alias("artist_id"),
            nullif(normalize_genre(col("genre")), lit("")).alias("genre"),
            nullif(btrim(vec![col("mood_tag")]), lit("")).alias("mood_tag"),
        ])?
        .filter(col("artist_id").is_not_null().and(col("genre").is_not_null()))?;

    keep_one_per_key(df, &["artist_id"], col("genre").sort(true, false))
}
