//! Parquet star-schema warehouse: one directory per table, dimensions in a
//! single `data.parquet` replaced atomically, facts appended into a Hive
//! partitioned layout.

use crate::data::{conform, empty_df, Table};
use crate::error::Error;
use crate::transform::TransformedTables;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::common::JoinType;
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::prelude::{col, DataFrame, ParquetReadOptions, SessionContext};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

const DATA_FILE: &str = "data.parquet";
const TMP_DATA_FILE: &str = "data.tmp.parquet";
const SCHEMA_FILE: &str = "schema.sql";

#[derive(Debug, Clone, PartialEq)]
pub struct TableLoad {
    pub table: Table,
    pub rows_loaded: usize,
    pub rows_total: usize,
}

#[derive(Clone, Debug)]
pub struct Warehouse {
    root: PathBuf,
}

impl Warehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Warehouse { root: root.into() }
    }

    pub fn table_dir(&self, table: Table) -> PathBuf {
        self.root.join(table.name())
    }

    /// Creates every table directory and the DDL file when absent.
    pub fn ensure_schema(&self) -> Result<(), Error> {
        for table in Table::ALL {
            fs::create_dir_all(self.table_dir(table))?;
        }

        let schema_path = self.root.join(SCHEMA_FILE);
        if !schema_path.is_file() {
            fs::write(&schema_path, schema_ddl())?;
            info!("created warehouse schema at {}", schema_path.display());
        }

        Ok(())
    }

    /// Reads a table conformed to its schema; a table never loaded is empty.
    pub async fn read_table(&self, ctx: &SessionContext, table: Table) -> Result<DataFrame, Error> {
        let schema = table.schema();

        if table.is_fact() {
            let dir = self.table_dir(table);
            if !contains_parquet(&dir)? {
                return empty_df(ctx, schema);
            }

            let file_schema = table.file_schema();
            let df = ctx
                .read_parquet(
                    format!("{}/", dir.display()),
                    ParquetReadOptions::default()
                        .schema(&file_schema)
                        .table_partition_cols(table.partition_columns()),
                )
                .await?;
            return conform(df, &schema);
        }

        let path = self.table_dir(table).join(DATA_FILE);
        if !path.is_file() {
            return empty_df(ctx, schema);
        }

        let df = ctx
            .read_parquet(
                path.to_string_lossy().to_string(),
                ParquetReadOptions::default().schema(&schema),
            )
            .await?;
        conform(df, &schema)
    }

    /// Replaces rows whose natural key is in `incoming` and inserts the rest.
    pub async fn upsert_dimension(
        &self,
        ctx: &SessionContext,
        table: Table,
        incoming: DataFrame,
    ) -> Result<TableLoad, Error> {
        validate_schema(table, &incoming)?;
        let key = table.key();

        let incoming = incoming.cache().await?;
        let rows_loaded = incoming.clone().count().await?;

        let incoming_keys = incoming
            .clone()
            .select(vec![col(key).alias("incoming_key")])?;
        let retained = self.read_table(ctx, table).await?.join(
            incoming_keys,
            JoinType::LeftAnti,
            &[key],
            &["incoming_key"],
            None,
        )?;

        let merged = retained.union(incoming)?.collect().await?;
        let rows_total = merged.iter().map(RecordBatch::num_rows).sum();

        if rows_total > 0 {
            self.replace_data_file(ctx, table, merged).await?;
        }

        Ok(TableLoad {
            table,
            rows_loaded,
            rows_total,
        })
    }

    /// Appends fact rows whose `event_id` is not loaded yet.
    pub async fn append_facts(
        &self,
        ctx: &SessionContext,
        incoming: DataFrame,
    ) -> Result<TableLoad, Error> {
        let table = Table::FactStreamingEvents;
        validate_schema(table, &incoming)?;

        let loaded_ids = self
            .read_table(ctx, table)
            .await?
            .select(vec![col(table.key()).alias("loaded_event_id")])?;
        let new_rows = incoming
            .join(
                loaded_ids,
                JoinType::LeftAnti,
                &[table.key()],
                &["loaded_event_id"],
                None,
            )?
            .cache()
            .await?;
        let rows_loaded = new_rows.clone().count().await?;

        if rows_loaded > 0 {
            let partition_by = table
                .partition_columns()
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            new_rows
                .write_parquet(
                    &format!("{}/", self.table_dir(table).display()),
                    DataFrameWriteOptions::new().with_partition_by(partition_by),
                    None,
                )
                .await?;
        }

        let rows_total = self.read_table(ctx, table).await?.count().await?;

        Ok(TableLoad {
            table,
            rows_loaded,
            rows_total,
        })
    }

    /// Loads every transformed table, dimensions before facts. A failing
    /// table stops the load; tables committed before it stay valid.
    pub async fn load(
        &self,
        ctx: &SessionContext,
        tables: TransformedTables,
    ) -> Result<Vec<TableLoad>, Error> {
        self.ensure_schema()?;

        let mut tables = tables.into_tables();
        tables.sort_by_key(|(table, _)| table.is_fact());

        let mut loads = Vec::with_capacity(tables.len());
        for (table, df) in tables {
            let load = if table.is_fact() {
                self.append_facts(ctx, df).await?
            } else {
                self.upsert_dimension(ctx, table, df).await?
            };

            info!(
                "loaded {}: {} incoming rows, {} rows total",
                table.name(),
                load.rows_loaded,
                load.rows_total
            );
            loads.push(load);
        }

        Ok(loads)
    }

    async fn replace_data_file(
        &self,
        ctx: &SessionContext,
        table: Table,
        batches: Vec<RecordBatch>,
    ) -> Result<(), Error> {
        let dir = self.table_dir(table);
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(TMP_DATA_FILE);
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }

        ctx.read_batches(batches)?
            .write_parquet(
                &tmp.to_string_lossy(),
                DataFrameWriteOptions::new().with_single_file_output(true),
                None,
            )
            .await?;

        fs::rename(&tmp, dir.join(DATA_FILE))?;
        Ok(())
    }
}

/// Rejects frames whose columns differ from the table schema in name,
/// order or type.
pub fn validate_schema(table: Table, df: &DataFrame) -> Result<(), Error> {
    let expected = table.schema();
    let expected: Vec<(&str, &DataType)> = expected
        .fields()
        .iter()
        .map(|f| (f.name().as_str(), f.data_type()))
        .collect();
    let actual: Vec<(&str, &DataType)> = df
        .schema()
        .fields()
        .iter()
        .map(|f| (f.name().as_str(), f.data_type()))
        .collect();

    if expected != actual {
        return Err(Error::SchemaMismatch {
            table: table.name().to_string(),
            detail: format!(
                "expected [{}], got [{}]",
                describe_columns(&expected),
                describe_columns(&actual)
            ),
        });
    }

    Ok(())
}

fn describe_columns(columns: &[(&str, &DataType)]) -> String {
    columns
        .iter()
        .map(|(name, data_type)| format!("{} {}", name, data_type))
        .collect::<Vec<_>>()
        .join(", ")
}

fn sql_type(data_type: &DataType) -> String {
    match data_type {
        DataType::Utf8 => "VARCHAR".to_string(),
        DataType::Int32 => "INTEGER".to_string(),
        DataType::Int64 => "BIGINT".to_string(),
        DataType::Float64 => "DOUBLE".to_string(),
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Date32 => "DATE".to_string(),
        DataType::Timestamp(TimeUnit::Millisecond, _) => "TIMESTAMP".to_string(),
        other => other.to_string().to_uppercase(),
    }
}

pub fn table_ddl(table: Table) -> String {
    let schema = table.schema();
    let mut lines: Vec<String> = schema
        .fields()
        .iter()
        .map(|field| {
            let constraint = if field.name() == table.key() {
                " NOT NULL"
            } else {
                ""
            };
            format!(
                "    {} {}{}",
                field.name(),
                sql_type(field.data_type()),
                constraint
            )
        })
        .collect();
    lines.push(format!("    PRIMARY KEY ({})", table.key()));

    let partitions = table.partition_columns();
    let partitioned = if partitions.is_empty() {
        String::new()
    } else {
        let names: Vec<String> = partitions.into_iter().map(|(name, _)| name).collect();
        format!("\n-- partitioned by {}", names.join(", "))
    };

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);{}",
        table.name(),
        lines.join(",\n"),
        partitioned
    )
}

pub fn schema_ddl() -> String {
    let mut ddl = Table::ALL
        .iter()
        .map(|table| table_ddl(*table))
        .collect::<Vec<_>>()
        .join("\n\n");
    ddl.push('\n');
    ddl
}

fn contains_parquet(dir: &Path) -> Result<bool, Error> {
    if !dir.is_dir() {
        return Ok(false);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if contains_parquet(&path)? {
                return Ok(true);
            }
        } else if path.extension().is_some_and(|ext| ext == "parquet") {
            return Ok(true);
        }
    }

    Ok(false)
}
