//! Stats time series: per-metric samples stored as `replace=false`
//! writes so every sample at a distinct timestamp survives, turning a
//! subject into an append-only series rather than a single latest-value
//! cell.

use std::collections::HashMap;

use futures::future;

use crate::backend::{Backend, SetEntry};
use crate::config::AuthToken;
use crate::error::{StoreError, StoreResult};
use crate::model::{Attribute, Subject, Timestamp, TimestampSpec, Value};
use crate::pool::MutationPool;

const METRIC_ATTRIBUTE_PREFIX: &str = "aff4:stats_store/";

fn metric_attribute(metric: &str) -> Attribute {
    Attribute::new(format!("{METRIC_ATTRIBUTE_PREFIX}{metric}"))
}

/// One sample of a named metric at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// The metric's name.
    pub metric: String,
    /// The sample's value.
    pub value: f64,
    /// When the sample was taken.
    pub timestamp: Timestamp,
}

/// Enqueues `samples` against `subject`, one `replace=false` write per
/// sample so distinct-timestamp samples of the same metric all survive.
pub fn write_samples(pool: &mut MutationPool, subject: &Subject, samples: &[Sample]) {
    for sample in samples {
        pool.multi_set(
            subject.clone(),
            vec![SetEntry {
                attribute: metric_attribute(&sample.metric),
                timestamp: sample.timestamp,
                value: Value::text(sample.value.to_string()),
            }],
            false,
            Vec::new(),
        );
    }
}

/// Reads every sample of `metric` on `subject` within `spec`.
///
/// # Errors
///
/// Returns [`StoreError::InvalidArgument`] if a stored sample's value is
/// not parseable as `f64`. Propagates backend errors.
pub async fn read_samples(backend: &dyn Backend, token: &AuthToken, subject: &Subject, metric: &str, spec: TimestampSpec) -> StoreResult<Vec<Sample>> {
    let attribute = metric_attribute(metric);
    let cells = backend.resolve(token, subject, std::slice::from_ref(&attribute), spec).await?;

    cells
        .into_iter()
        .map(|cell| {
            let raw = cell.value.as_text().ok_or_else(|| StoreError::InvalidArgument(format!("sample for {metric} is not text")))?;
            let value: f64 = raw
                .parse()
                .map_err(|_| StoreError::InvalidArgument(format!("sample for {metric} is not a valid float: {raw}")))?;
            Ok(Sample {
                metric: metric.to_string(),
                value,
                timestamp: cell.timestamp,
            })
        })
        .collect()
}

/// As [`read_samples`], fanned out across multiple subjects for the same
/// metric.
///
/// # Errors
///
/// Propagates backend and parse errors.
pub async fn read_for_subjects(
    backend: &dyn Backend,
    token: &AuthToken,
    subjects: &[Subject],
    metric: &str,
    spec: TimestampSpec,
) -> StoreResult<HashMap<Subject, Vec<Sample>>> {
    let results = future::try_join_all(subjects.iter().map(|subject| read_samples(backend, token, subject, metric, spec))).await?;
    Ok(subjects.iter().cloned().zip(results).collect())
}

/// Enqueues deletion of every sample of `metric` on `subject` whose
/// timestamp falls in `[start, end]`.
///
/// # Errors
///
/// Returns [`StoreError::InvalidArgument`] if `spec` is
/// [`TimestampSpec::Newest`] — deleting "whichever sample happens to be
/// newest" is not a meaningful range operation on a series.
pub fn delete_in_range(pool: &mut MutationPool, subject: &Subject, metric: &str, spec: TimestampSpec) -> StoreResult<()> {
    if matches!(spec, TimestampSpec::Newest) {
        return Err(StoreError::InvalidArgument(
            "stats_store::delete_in_range requires an explicit range, not Newest".to_string(),
        ));
    }
    pool.delete_attributes(subject.clone(), vec![(metric_attribute(metric), spec)]);
    Ok(())
}
