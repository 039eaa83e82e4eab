// =============================================================================
// Bar Reconciler — per-minute diff/gap-fill loop against broker history
// =============================================================================
//
// Mirrors the Python loader's grid-build → gap-fill → diff/write shape, one
// `update_instrument` call per attempt. The Minute Grid is owned exclusively
// by this module for the duration of a single call and discarded after; no
// shared mutable state between instruments or subsystems beyond the store.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::calendar::{CalendarCache, ExchangeCalendar};
use crate::error::IngestError;
use crate::store::StoreAdapter;
use crate::types::{Bar, Instrument};

const GAP_FILL_LOOKBACK_MINUTES: i64 = 1000;
const PER_MINUTE_DEADLINE_SECS: i64 = 10;
const RETRY_SLEEP_SECS: u64 = 3;

fn grid_lookback() -> ChronoDuration {
    ChronoDuration::days(3)
}

fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn parse_dt(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// One slot in the Minute Grid: whether the exchange was open, the
/// previously stored record (if any), and the record computed this pass
/// (if any).
struct GridCell {
    dt: DateTime<Utc>,
    is_open: bool,
    old: Option<Bar>,
    new: Option<Bar>,
}

/// Build the grid from `start` to `target` inclusive, one cell per minute.
fn build_grid<C: ExchangeCalendar>(
    calendar: &CalendarCache<C>,
    calendar_code: crate::types::CalendarCode,
    start: DateTime<Utc>,
    target: DateTime<Utc>,
) -> BTreeMap<i64, GridCell> {
    let mut grid = BTreeMap::new();
    let mut cur = start;
    while cur <= target {
        grid.insert(
            cur.timestamp(),
            GridCell {
                dt: cur,
                is_open: calendar.is_open_at(calendar_code, cur),
                old: None,
                new: None,
            },
        );
        cur += ChronoDuration::minutes(1);
    }
    grid
}

/// Load existing records for `[start, +inf)` into the matching cells.
/// A JSON-decode error on any stored record aborts the whole attempt.
async fn load_old(
    store: &dyn StoreAdapter,
    instrument: &Instrument,
    start: DateTime<Utc>,
    grid: &mut BTreeMap<i64, GridCell>,
) -> Result<(), IngestError> {
    let members = store
        .range_by_score(&instrument.key(), start.timestamp(), 9_999_999_999)
        .await?;

    for raw in members {
        let bar: Bar = serde_json::from_slice(&raw)?;
        if let Some(dt) = parse_dt(&bar.dt) {
            if let Some(cell) = grid.get_mut(&dt.timestamp()) {
                cell.old = Some(bar);
            }
        }
    }
    Ok(())
}

/// Fill gaps by requesting history from the broker when a stale stretch is
/// found, then marking closed-but-unrecorded cells.
async fn fill_gaps(
    broker: &BrokerClient,
    instrument: &Instrument,
    grid: &mut BTreeMap<i64, GridCell>,
) -> Result<(), IngestError> {
    let fallback_far_past = grid
        .values()
        .next()
        .map(|c| c.dt)
        .unwrap_or_else(Utc::now)
        - grid_lookback();

    let last_open_dt = grid
        .values()
        .filter(|c| c.is_open)
        .map(|c| c.dt)
        .max()
        .unwrap_or(fallback_far_past);

    let mut first_bad_dt = None;
    for cell in grid.values() {
        let delta_minutes = (last_open_dt - cell.dt).num_minutes();
        if delta_minutes > GAP_FILL_LOOKBACK_MINUTES {
            continue;
        }
        if delta_minutes < 0 {
            break;
        }
        let bad = match &cell.old {
            None => true,
            Some(old) => old.has_error(),
        };
        if bad {
            first_bad_dt = Some(cell.dt);
            break;
        }
    }

    if let Some(first_bad_dt) = first_bad_dt {
        let period = ((last_open_dt - first_bad_dt).num_minutes() + 5).max(1);
        match broker.history_request(instrument.conid, period).await {
            Ok(bars) => merge_history(grid, &bars),
            Err(err) => warn!(conid = instrument.conid, %err, "history request failed"),
        }
    }

    for cell in grid.values_mut() {
        if !cell.is_open {
            let needs_closed = match &cell.old {
                None => true,
                Some(old) => old.has_error(),
            };
            if needs_closed {
                cell.new = Some(Bar::closed_at(fmt_dt(cell.dt)));
            }
        }
    }

    Ok(())
}

fn merge_history(grid: &mut BTreeMap<i64, GridCell>, bars: &[crate::broker::HistoryBar]) {
    let mut prev_dt: Option<DateTime<Utc>> = None;
    for bar in bars {
        let dt = match DateTime::from_timestamp_millis(bar.t) {
            Some(d) => d,
            None => continue,
        };

        if let Some(prev) = prev_dt {
            if dt - prev > ChronoDuration::minutes(1) {
                let mut gap = prev + ChronoDuration::minutes(1);
                while gap < dt {
                    if let Some(cell) = grid.get_mut(&gap.timestamp()) {
                        if cell.is_open {
                            cell.new = Some(Bar::empty_at(fmt_dt(gap)));
                        }
                    }
                    gap += ChronoDuration::minutes(1);
                }
            }
        }

        if let Some(cell) = grid.get_mut(&dt.timestamp()) {
            cell.new = Some(Bar {
                dt: fmt_dt(dt),
                o: Some(bar.o),
                h: Some(bar.h),
                l: Some(bar.l),
                c: Some(bar.c),
                vol: Some(bar.v),
                ..Default::default()
            });
        }

        prev_dt = Some(dt);
    }
}

/// Diff pass: write any cell whose computed record differs from (or fills
/// in for) what's stored. Returns whether the target cell received a write
/// this pass (used only for logging; `done` is evaluated separately).
async fn diff_and_write(
    store: &dyn StoreAdapter,
    instrument: &Instrument,
    grid: &BTreeMap<i64, GridCell>,
    target_ts: i64,
) -> Result<(), IngestError> {
    for (&ts, cell) in grid {
        if let Some(old) = &cell.old {
            let stripped_old = old.stripped();
            if let Some(new) = &cell.new {
                if *new != stripped_old {
                    let mut written = new.clone();
                    written.fix = Some(1);
                    replace_data(store, instrument, &written, ts).await?;
                }
            }
        } else if let Some(new) = &cell.new {
            let mut written = new.clone();
            if cell.dt < grid.get(&target_ts).map(|c| c.dt).unwrap_or(cell.dt) {
                written.late = Some(1);
            }
            replace_data(store, instrument, &written, ts).await?;
        }
    }
    Ok(())
}

/// `removeByScore(key, ts, ts)` then `add(key, json, ts)` then publish to
/// the bars channel with `conid`/`symbol` merged in. Not atomic, but safe
/// under the single-writer-per-key invariant.
async fn replace_data(
    store: &dyn StoreAdapter,
    instrument: &Instrument,
    bar: &Bar,
    ts: i64,
) -> Result<(), IngestError> {
    let key = instrument.key();
    let json = bar.to_compact_json()?;
    info!(key = %key, ts, %json, "writing bar");

    store.remove_by_score(&key, ts, ts).await?;
    store.add(&key, &json, ts).await?;

    let mut value = serde_json::to_value(bar)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("conid".into(), serde_json::Value::from(instrument.conid));
        map.insert(
            "symbol".into(),
            serde_json::Value::from(instrument.display_symbol()),
        );
    }
    store
        .publish(&instrument.bars_channel(), &value.to_string())
        .await?;
    Ok(())
}

fn done(grid: &BTreeMap<i64, GridCell>, target_ts: i64) -> bool {
    match grid.get(&target_ts) {
        None => false,
        Some(cell) => cell.new.is_some() || cell.old.as_ref().map(|o| !o.has_error()).unwrap_or(false),
    }
}

/// One attempt at reconciling `instrument` up through `target`. Errors are
/// treated by the caller identically to `Ok(false)`: retry or move on.
pub async fn update_instrument<C: ExchangeCalendar>(
    broker: &BrokerClient,
    store: &dyn StoreAdapter,
    calendar: &CalendarCache<C>,
    instrument: &Instrument,
    target: DateTime<Utc>,
) -> Result<bool, IngestError> {
    let now = Utc::now()
        .with_second(0)
        .unwrap()
        .with_nanosecond(0)
        .unwrap();
    let start = now - grid_lookback();

    let mut grid = build_grid(calendar, instrument.calendar, start, target);
    load_old(store, instrument, start, &mut grid).await?;
    fill_gaps(broker, instrument, &mut grid).await?;
    diff_and_write(store, instrument, &grid, target.timestamp()).await?;

    Ok(done(&grid, target.timestamp()))
}

/// Run a single minute's worth of reconciliation across all instruments,
/// shuffled so a stuck instrument doesn't starve the rest. Returns once
/// every instrument is done, times out, or the minute rolls over.
pub async fn run_minute<C: ExchangeCalendar>(
    broker: &BrokerClient,
    store: &dyn StoreAdapter,
    calendar: &CalendarCache<C>,
    instruments: &[Instrument],
    loop_start: DateTime<Utc>,
    target: DateTime<Utc>,
) {
    let mut order: Vec<&Instrument> = instruments.iter().collect();
    order.shuffle(&mut rand::thread_rng());

    let deadline = loop_start + ChronoDuration::seconds(PER_MINUTE_DEADLINE_SECS);

    for instrument in order {
        loop {
            let result = update_instrument(broker, store, calendar, instrument, target).await;
            match result {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => warn!(conid = instrument.conid, %err, "update_instrument failed"),
            }

            let now = Utc::now();
            if now.minute() != loop_start.minute() {
                warn!(conid = instrument.conid, "minute rolled over mid-reconciliation");
                let _ = replace_data(
                    store,
                    instrument,
                    &Bar::error_at(fmt_dt(target), 3),
                    target.timestamp(),
                )
                .await;
                return;
            }

            if now > deadline {
                warn!(conid = instrument.conid, "instrument reconciliation timed out");
                let _ = replace_data(
                    store,
                    instrument,
                    &Bar::error_at(fmt_dt(target), 2),
                    target.timestamp(),
                )
                .await;
                break;
            }

            tokio::time::sleep(std::time::Duration::from_secs(RETRY_SLEEP_SECS)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ReferenceCalendar;
    use crate::config::InstrumentConfig;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    fn aapl() -> Instrument {
        Instrument::from_config(&InstrumentConfig {
            conid: 265598,
            symbol: "AAPL".into(),
            exchange: "NASDAQ".into(),
        })
    }

    fn minute(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn build_grid_covers_inclusive_range_one_minute_steps() {
        let calendar = CalendarCache::new(ReferenceCalendar, 8);
        let start = minute(2024, 6, 3, 14, 0);
        let target = minute(2024, 6, 3, 14, 3);
        let grid = build_grid(&calendar, crate::types::CalendarCode::Nasdaq, start, target);
        assert_eq!(grid.len(), 4);
        assert!(grid.contains_key(&start.timestamp()));
        assert!(grid.contains_key(&target.timestamp()));
    }

    #[tokio::test]
    async fn load_old_populates_matching_cells_and_rejects_bad_json() {
        let store = InMemoryStore::new();
        let instrument = aapl();
        let start = minute(2024, 6, 3, 14, 0);
        let target = minute(2024, 6, 3, 14, 2);
        let bar = Bar::closed_at(fmt_dt(start));
        store
            .add(&instrument.key(), &bar.to_compact_json().unwrap(), start.timestamp())
            .await
            .unwrap();

        let calendar = CalendarCache::new(ReferenceCalendar, 8);
        let mut grid = build_grid(&calendar, instrument.calendar, start, target);
        load_old(&store, &instrument, start, &mut grid).await.unwrap();
        assert!(grid.get(&start.timestamp()).unwrap().old.is_some());
    }

    #[test]
    fn done_is_true_when_target_cell_has_new_bar() {
        let mut grid = BTreeMap::new();
        let dt = minute(2024, 6, 3, 14, 0);
        grid.insert(
            dt.timestamp(),
            GridCell {
                dt,
                is_open: true,
                old: None,
                new: Some(Bar::empty_at(fmt_dt(dt))),
            },
        );
        assert!(done(&grid, dt.timestamp()));
    }

    #[test]
    fn done_is_true_when_old_has_no_error_and_no_new() {
        let mut grid = BTreeMap::new();
        let dt = minute(2024, 6, 3, 14, 0);
        grid.insert(
            dt.timestamp(),
            GridCell {
                dt,
                is_open: true,
                old: Some(Bar::closed_at(fmt_dt(dt))),
                new: None,
            },
        );
        assert!(done(&grid, dt.timestamp()));
    }

    #[test]
    fn done_is_false_when_old_has_error_and_no_new() {
        let mut grid = BTreeMap::new();
        let dt = minute(2024, 6, 3, 14, 0);
        grid.insert(
            dt.timestamp(),
            GridCell {
                dt,
                is_open: true,
                old: Some(Bar::error_at(fmt_dt(dt), 2)),
                new: None,
            },
        );
        assert!(!done(&grid, dt.timestamp()));
    }

    #[test]
    fn done_is_false_when_target_cell_is_absent_from_grid() {
        let grid: BTreeMap<i64, GridCell> = BTreeMap::new();
        assert!(!done(&grid, 0));
    }

    #[test]
    fn done_is_false_when_cell_present_but_empty() {
        let mut grid = BTreeMap::new();
        let dt = minute(2024, 6, 3, 14, 0);
        grid.insert(
            dt.timestamp(),
            GridCell {
                dt,
                is_open: true,
                old: None,
                new: None,
            },
        );
        assert!(!done(&grid, dt.timestamp()));
    }

    #[tokio::test]
    async fn diff_and_write_marks_fix_on_changed_old_record() {
        let store = InMemoryStore::new();
        let instrument = aapl();
        let dt = minute(2024, 6, 3, 14, 0);
        let mut grid = BTreeMap::new();
        grid.insert(
            dt.timestamp(),
            GridCell {
                dt,
                is_open: true,
                old: Some(Bar {
                    dt: fmt_dt(dt),
                    o: Some(1.0),
                    h: Some(1.0),
                    l: Some(1.0),
                    c: Some(1.0),
                    vol: Some(1.0),
                    ..Default::default()
                }),
                new: Some(Bar {
                    dt: fmt_dt(dt),
                    o: Some(2.0),
                    h: Some(2.0),
                    l: Some(2.0),
                    c: Some(2.0),
                    vol: Some(2.0),
                    ..Default::default()
                }),
            },
        );

        diff_and_write(&store, &instrument, &grid, dt.timestamp()).await.unwrap();
        let published = store.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].1.contains("\"fix\":1"));
    }

    #[tokio::test]
    async fn diff_and_write_marks_late_for_new_record_before_target() {
        let store = InMemoryStore::new();
        let instrument = aapl();
        let target = minute(2024, 6, 3, 14, 5);
        let past = minute(2024, 6, 3, 14, 0);
        let mut grid = BTreeMap::new();
        grid.insert(
            target.timestamp(),
            GridCell {
                dt: target,
                is_open: true,
                old: None,
                new: None,
            },
        );
        grid.insert(
            past.timestamp(),
            GridCell {
                dt: past,
                is_open: true,
                old: None,
                new: Some(Bar::empty_at(fmt_dt(past))),
            },
        );

        diff_and_write(&store, &instrument, &grid, target.timestamp()).await.unwrap();
        let published = store.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].1.contains("\"late\":1"));
    }
}
