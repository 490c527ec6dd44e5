use crate::data::Table;
use crate::error::Error;
use crate::warehouse::Warehouse;
use datafusion::arrow::array::Array;
use datafusion::common::cast::{as_int32_array, as_int64_array};
use datafusion::functions_aggregate::expr_fn::count;
use datafusion::prelude::{col, SessionContext};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Plays of one year compared with the year before.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct YearOverYear {
    pub year: i32,
    pub plays: u64,
    pub previous_plays: Option<u64>,
    pub change_percent: Option<f64>,
}

impl fmt::Display for YearOverYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.previous_plays, self.change_percent) {
            (Some(previous), Some(change)) => write!(
                f,
                "{}: {} plays ({:+.2}% vs {} in {})",
                self.year,
                self.plays,
                change,
                previous,
                self.year - 1
            ),
            _ => write!(
                f,
                "{}: {} plays (no plays in {})",
                self.year,
                self.plays,
                self.year - 1
            ),
        }
    }
}

/// Year-over-year change per year, oldest first. A year whose previous
/// calendar year has no plays has no change.
pub fn year_over_year(counts: &[(i32, u64)]) -> Vec<YearOverYear> {
    let by_year: HashMap<i32, u64> = counts.iter().copied().collect();
    let mut years: Vec<i32> = by_year.keys().copied().collect();
    years.sort_unstable();

    years
        .into_iter()
        .map(|year| {
            let plays = by_year[&year];
            let previous_plays = by_year.get(&(year - 1)).copied().filter(|p| *p > 0);
            let change_percent = previous_plays.map(|previous| {
                let change = (plays as f64 - previous as f64) / previous as f64 * 100.0;
                (change * 100.0).round() / 100.0
            });

            YearOverYear {
                year,
                plays,
                previous_plays,
                change_percent,
            }
        })
        .collect()
}

/// Counts loaded plays per year.
pub async fn yearly_play_counts(
    ctx: &SessionContext,
    warehouse: &Warehouse,
) -> Result<Vec<(i32, u64)>, Error> {
    let batches = warehouse
        .read_table(ctx, Table::FactStreamingEvents)
        .await?
        .filter(col("year").is_not_null())?
        .aggregate(
            vec![col("year").alias("year")],
            vec![count(col("event_id")).alias("plays")],
        )?
        .collect()
        .await?;

    let mut counts = Vec::new();
    for batch in &batches {
        let years = as_int32_array(batch.column(0))?;
        let plays = as_int64_array(batch.column(1))?;
        for i in 0..batch.num_rows() {
            if !years.is_null(i) {
                counts.push((years.value(i), plays.value(i).max(0) as u64));
            }
        }
    }

    Ok(counts)
}

pub async fn year_over_year_report(
    ctx: &SessionContext,
    warehouse: &Warehouse,
) -> Result<Vec<YearOverYear>, Error> {
    let counts = yearly_play_counts(ctx, warehouse).await?;
    if counts.is_empty() {
        return Err(Error::NoData {
            message: "No plays loaded into the warehouse".to_string(),
        });
    }

    Ok(year_over_year(&counts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_over_year_change() {
        let report = year_over_year(&[(2024, 80), (2023, 100)]);

        assert_eq!(
            report,
            vec![
                YearOverYear {
                    year: 2023,
                    plays: 100,
                    previous_plays: None,
                    change_percent: None,
                },
                YearOverYear {
                    year: 2024,
                    plays: 80,
                    previous_plays: Some(100),
                    change_percent: Some(-20.0),
                },
            ]
        );
    }

    #[test]
    fn test_year_over_year_rounds_and_skips_gaps() {
        let report = year_over_year(&[(2020, 3), (2021, 4), (2023, 10)]);

        assert_eq!(report[1].change_percent, Some(33.33));
        assert_eq!(report[2].previous_plays, None);
        assert_eq!(report[2].change_percent, None);
    }

    #[test]
    fn test_display() {
        let report = year_over_year(&[(2023, 100), (2024, 80)]);
        assert_eq!(report[1].to_string(), "2024: 80 plays (-20.00% vs 100 in 2023)");
        assert_eq!(report[0].to_string(), "2023: 100 plays (no plays in 2022)");
    }

    #[tokio::test]
    async fn test_report_on_empty_warehouse() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let warehouse = Warehouse::new(temp_dir.path());
        let ctx = SessionContext::new();

        let result = year_over_year_report(&ctx, &warehouse).await;
        assert!(matches!(result, Err(Error::NoData { .. })));
    }
}
