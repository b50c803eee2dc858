use std::path::Path;

use rama::error::{BoxError, ErrorContext as _};

use super::Summary;

/// Write the summary in the two-line stats format consumed by the plot scripts:
///
/// ```text
/// <p50>, <p95>, <p99>          (latency in microseconds)
/// <offered>, <achieved>        (requests per second)
/// ```
pub async fn write_stats_file(summary: &Summary, path: &Path) -> Result<(), BoxError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create stats directory")
            .with_context_debug_field("path", || dir.to_owned())?;
    }

    let (p50, p95, p99) = summary
        .latency
        .map(|l| (l.p50_us, l.p95_us, l.p99_us))
        .unwrap_or_default();
    let content = format!(
        "{p50}, {p95}, {p99}\n{}, {}\n",
        summary.offered_rps.floor() as u64,
        summary.achieved_rps.floor() as u64,
    );

    tokio::fs::write(path, content)
        .await
        .context("write stats file")
        .with_context_debug_field("path", || path.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Counters, LatencySummary};

    #[tokio::test]
    async fn writes_two_line_stats() {
        let dir = std::env::temp_dir().join(format!("server-bench-stats-{}", std::process::id()));
        let path = dir.join("closed").join("stats.txt");

        let summary = Summary {
            runtime_secs: 2.,
            counts: Counters::default(),
            latency: Some(LatencySummary {
                min_us: 1,
                mean_us: 5.,
                p50_us: 4,
                p90_us: 8,
                p95_us: 9,
                p99_us: 12,
                p999_us: 13,
                max_us: 14,
            }),
            offered_rps: 10.5,
            achieved_rps: 9.9,
        };
        write_stats_file(&summary, &path).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "4, 9, 12\n10, 9\n");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
