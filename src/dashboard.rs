// =============================================================================
// Status dashboard — hourly bucket CSV snapshot of reconciliation health
// =============================================================================
//
// Builds the full CSV body in memory, then writes it to a `.tmp` sibling
// path and renames it over the configured path, matching the atomic
// tmp+rename write this codebase's own config persistence already uses.
// =============================================================================

use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use tracing::info;

use crate::error::IngestError;
use crate::store::StoreAdapter;
use crate::types::{Bar, Instrument};

const HOURLY_BUCKETS: i64 = 120;

#[derive(Debug, Default, Clone, Copy)]
struct HourStats {
    ok: u64,
    closed: u64,
    error: u64,
    fix: u64,
    empty: u64,
}

/// Category precedence when classifying a stored bar for the dashboard:
/// error > closed > empty > fix-or-late > ok. A JSON parse failure counts
/// as `error`.
fn classify(raw: &[u8]) -> &'static str {
    let bar: Bar = match serde_json::from_slice(raw) {
        Ok(b) => b,
        Err(_) => return "error",
    };
    if bar.error.is_some() {
        "error"
    } else if bar.closed.is_some() {
        "closed"
    } else if bar.empty.is_some() {
        "empty"
    } else if bar.fix.is_some() || bar.late.is_some() {
        "fix"
    } else {
        "ok"
    }
}

fn stats_for_hour(members: &[Vec<u8>]) -> HourStats {
    let mut stats = HourStats::default();
    for member in members {
        match classify(member) {
            "error" => stats.error += 1,
            "closed" => stats.closed += 1,
            "empty" => stats.empty += 1,
            "fix" => stats.fix += 1,
            _ => stats.ok += 1,
        }
    }
    stats
}

/// Render the last `HOURLY_BUCKETS` hours of per-instrument stats and
/// atomically write them to `csv_path`.
pub async fn write(
    store: &dyn StoreAdapter,
    instruments: &[Instrument],
    csv_path: impl AsRef<Path>,
) -> Result<(), IngestError> {
    let now = Utc::now();
    let start = (now - ChronoDuration::hours(HOURLY_BUCKETS))
        .with_minute(0)
        .unwrap()
        .with_second(0)
        .unwrap()
        .with_nanosecond(0)
        .unwrap();

    let mut body = String::from("ticker,group,ok,closed,error,fix,empty\n");

    for instrument in instruments {
        let key = instrument.key();
        let mut hour = start;
        loop {
            let lo = hour.timestamp();
            let hi = lo + 3599;
            let members = store.range_by_score(&key, lo, hi).await?;
            let stats = stats_for_hour(&members);

            body.push_str(&format!(
                "{key},{},{},{},{},{},{}\n",
                fmt_hour(hour),
                stats.ok,
                stats.closed,
                stats.error,
                stats.fix,
                stats.empty,
            ));

            hour += ChronoDuration::hours(1);
            if hour > now {
                break;
            }
        }
    }

    write_atomic(csv_path.as_ref(), &body)?;
    info!(path = %csv_path.as_ref().display(), "dashboard CSV written");
    Ok(())
}

fn fmt_hour(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn write_atomic(path: &Path, body: &str) -> Result<(), IngestError> {
    let tmp_path = path.with_extension("csv.tmp");
    std::fs::write(&tmp_path, body)
        .map_err(|e| IngestError::Config(format!("writing dashboard tmp file: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| IngestError::Config(format!("renaming dashboard file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentConfig;
    use crate::store::InMemoryStore;
    use crate::types::Bar;

    fn aapl() -> Instrument {
        Instrument::from_config(&InstrumentConfig {
            conid: 265598,
            symbol: "AAPL".into(),
            exchange: "NASDAQ".into(),
        })
    }

    #[test]
    fn classify_precedence_error_beats_everything() {
        let bar = Bar {
            error: Some(2),
            closed: Some(1),
            fix: Some(1),
            ..Default::default()
        };
        let raw = serde_json::to_vec(&bar).unwrap();
        assert_eq!(classify(&raw), "error");
    }

    #[test]
    fn classify_precedence_closed_beats_empty_and_fix() {
        let bar = Bar {
            closed: Some(1),
            fix: Some(1),
            ..Default::default()
        };
        let raw = serde_json::to_vec(&bar).unwrap();
        assert_eq!(classify(&raw), "closed");
    }

    #[test]
    fn classify_fix_or_late_both_count_as_fix() {
        let bar = Bar {
            late: Some(1),
            ..Default::default()
        };
        let raw = serde_json::to_vec(&bar).unwrap();
        assert_eq!(classify(&raw), "fix");
    }

    #[test]
    fn classify_ok_when_no_flags_set() {
        let bar = Bar {
            o: Some(1.0),
            ..Default::default()
        };
        let raw = serde_json::to_vec(&bar).unwrap();
        assert_eq!(classify(&raw), "ok");
    }

    #[test]
    fn classify_unparseable_json_counts_as_error() {
        assert_eq!(classify(b"not json"), "error");
    }

    #[tokio::test]
    async fn write_produces_header_and_one_row_per_hour_bucket() {
        let store = InMemoryStore::new();
        let instrument = aapl();
        let dir = std::env::temp_dir().join(format!("portal-ingest-dash-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dash.csv");

        write(&store, &[instrument], &path).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("ticker,group,ok,closed,error,fix,empty\n"));
        assert!(contents.lines().count() > 1);

        std::fs::remove_file(&path).ok();
    }
}
