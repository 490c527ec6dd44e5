use crate::api_client::{ApiClient, SpotifyApi};
use crate::config::Config;
use crate::credentials::Credentials;
use crate::error::Error;
use crate::extractor::{self, ExtractionReport};
use crate::reference_loader::{CsvReferenceLoader, ReferenceLoader};
use crate::report::{self, YearOverYear};
use crate::staging::{StagedBatch, StagingArea};
use crate::transform::{self, StagedRecords, TransformedTables};
use crate::warehouse::{TableLoad, Warehouse};
use datafusion::prelude::SessionContext;
use log::{info, warn};
use url::Url;

pub fn authorize_url(config: &Config) -> Result<Url, Error> {
    let credentials = Credentials::from_config(config)?;
    credentials.authorize_url(&config.accounts_url)
}

/// Authenticates and stages one extraction batch.
pub async fn run_extract(config: &Config) -> Result<ExtractionReport, Error> {
    let api = connect(config).await?;
    let staging = StagingArea::new(&config.staging_dir);

    extractor::extract(&api, &staging, config.recently_played_limit).await
}

/// Transforms the named batch, or the latest complete one.
pub async fn run_transform(
    config: &Config,
    batch_id: Option<&str>,
) -> Result<StagedBatch, Error> {
    let staging = StagingArea::new(&config.staging_dir);
    let batch = staging.resolve(batch_id)?;
    let reference_loader = CsvReferenceLoader::new(config);
    let ctx = SessionContext::new();

    transform_batch(&ctx, &batch, &reference_loader).await?;
    Ok(batch)
}

/// Loads the transformed output of the named batch, or the latest one.
pub async fn run_load(
    config: &Config,
    batch_id: Option<&str>,
) -> Result<Vec<TableLoad>, Error> {
    let staging = StagingArea::new(&config.staging_dir);
    let batch = staging.resolve(batch_id)?;
    let warehouse = Warehouse::new(&config.warehouse_dir);
    let ctx = SessionContext::new();

    load_batch(&ctx, &batch, &warehouse).await
}

/// Extract, transform and load in one go.
pub async fn run_pipeline(config: &Config) -> Result<ExtractionReport, Error> {
    let api = connect(config).await?;
    let reference_loader = CsvReferenceLoader::new(config);

    pipeline(&api, &reference_loader, config).await
}

pub async fn run_report(config: &Config) -> Result<Vec<YearOverYear>, Error> {
    let warehouse = Warehouse::new(&config.warehouse_dir);
    let ctx = SessionContext::new();

    report::year_over_year_report(&ctx, &warehouse).await
}

async fn connect(config: &Config) -> Result<ApiClient, Error> {
    let credentials = Credentials::from_config(config)?;
    ApiClient::authenticate(config, &credentials).await
}

pub async fn pipeline<A, R>(
    api: &A,
    reference_loader: &R,
    config: &Config,
) -> Result<ExtractionReport, Error>
where
    A: SpotifyApi + ?Sized,
    R: ReferenceLoader + ?Sized,
{
    let staging = StagingArea::new(&config.staging_dir);
    let warehouse = Warehouse::new(&config.warehouse_dir);
    let ctx = SessionContext::new();

    let report = extractor::extract(api, &staging, config.recently_played_limit).await?;
    transform_batch(&ctx, &report.batch, reference_loader).await?;
    load_batch(&ctx, &report.batch, &warehouse).await?;

    Ok(report)
}

pub async fn transform_batch<R: ReferenceLoader + ?Sized>(
    ctx: &SessionContext,
    batch: &StagedBatch,
    reference_loader: &R,
) -> Result<(), Error> {
    info!("transforming batch {}", batch.id());
    for dataset in batch.manifest()?.failed() {
        warn!(
            "batch {} has incomplete {} data",
            batch.id(),
            dataset.file_prefix()
        );
    }

    let records = StagedRecords::read(batch)?;
    let reference = reference_loader.load(ctx).await?;
    let tables = transform::transform(ctx, &records, reference).await?;

    tables.write(&batch.transformed_dir()).await
}

pub async fn load_batch(
    ctx: &SessionContext,
    batch: &StagedBatch,
    warehouse: &Warehouse,
) -> Result<Vec<TableLoad>, Error> {
    info!("loading batch {}", batch.id());

    let tables = TransformedTables::read(ctx, &batch.transformed_dir()).await?;
    warehouse.load(ctx, tables).await
}
