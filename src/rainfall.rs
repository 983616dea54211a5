//! 転倒ます雨量計の転倒イベントから、2分間隔の降雨強度を再構成する。
//!
//! 転倒イベントは、転倒時刻以降で最初の2分刻みの時刻（区間の終了時刻）に集約する。
//! 直前に転倒があった区間からの経過時間（最大10分）を平均化期間として、集約した転倒を
//! 当該区間と、それより前の区間に配分する。

use std::collections::BTreeMap;

use time::{Duration, PrimitiveDateTime, Time};
use tracing::debug;

use crate::{IntensityBin, TipEvent};

/// 区間の長さ（分）
pub const GRID_MINUTES: i64 = 2;

/// 平均化期間の上限（分）
///
/// 最初の転倒の平均化期間にも使用する。
pub const MAX_AVERAGING_MINUTES: f64 = 10.0;

/// 1時間の分数
const MINUTES_PER_HOUR: f64 = 60.0;

/// Rainfallエラー型
#[derive(Debug, Clone, thiserror::Error)]
pub enum RainfallError {
    /// 転倒1回あたりの雨量が不正
    #[error("転倒1回あたりの雨量が不正です。`{0}`")]
    InvalidBucketDepth(f64),

    /// 区間の日時が表現できる範囲を超えた
    #[error("`{0}`を含む区間の日時が表現できる範囲を超えています。")]
    DateTimeOverflow(PrimitiveDateTime),
}

/// Rainfall結果型
pub type RainfallResult<T> = Result<T, RainfallError>;

/// 転倒イベントから2分間隔の降雨強度を再構成する。
///
/// 転倒イベントがない場合は、空の系列を返す。
///
/// # 引数
///
/// * `tips` - 転倒イベント（順不同）
/// * `bucket_depth_mm` - 転倒1回あたりの雨量（mm）
///
/// # 戻り値
///
/// 区間の終了時刻の昇順に並んだ降雨強度
pub fn reconstruct(tips: &[TipEvent], bucket_depth_mm: f64) -> RainfallResult<Vec<IntensityBin>> {
    if !bucket_depth_mm.is_finite() || bucket_depth_mm <= 0.0 {
        return Err(RainfallError::InvalidBucketDepth(bucket_depth_mm));
    }

    // 区間の終了時刻ごとの転倒回数
    let mut tips_by_grid_point: BTreeMap<PrimitiveDateTime, u32> = BTreeMap::new();
    for tip in tips {
        let grid_point = next_grid_point(tip.timestamp)
            .ok_or(RainfallError::DateTimeOverflow(tip.timestamp))?;
        *tips_by_grid_point.entry(grid_point).or_insert(0) += 1;
    }
    let (Some((&first, _)), Some((&last, _))) = (
        tips_by_grid_point.first_key_value(),
        tips_by_grid_point.last_key_value(),
    ) else {
        return Ok(Vec::new());
    };

    let step = Duration::minutes(GRID_MINUTES);
    let mut intensities: BTreeMap<PrimitiveDateTime, f64> = BTreeMap::new();
    let mut grid_point = first;
    while grid_point <= last {
        intensities.insert(grid_point, 0.0);
        let Some(next) = grid_point.checked_add(step) else {
            break;
        };
        grid_point = next;
    }

    let mut last_tip_time: Option<PrimitiveDateTime> = None;
    for (&grid_point, &tips_in_bin) in &tips_by_grid_point {
        let gap_minutes = last_tip_time.map_or(MAX_AVERAGING_MINUTES, |last_tip_time| {
            (grid_point - last_tip_time).as_seconds_f64() / 60.0
        });
        let avg_period = gap_minutes.min(MAX_AVERAGING_MINUTES);
        let allocation = allocate(tips_in_bin, avg_period, bucket_depth_mm);

        *intensities.entry(grid_point).or_insert(0.0) += allocation.current_rate;
        if let Some(backfill_rate) = allocation.backfill_rate {
            for periods_back in (1..allocation.periods_in_avg).rev() {
                let earlier = grid_point
                    .checked_sub(step * periods_back)
                    .ok_or(RainfallError::DateTimeOverflow(grid_point))?;
                *intensities.entry(earlier).or_insert(0.0) += backfill_rate;
            }
        }
        last_tip_time = Some(grid_point);
    }
    debug!(
        tips = tips.len(),
        groups = tips_by_grid_point.len(),
        bins = intensities.len(),
        "降雨強度を再構成しました"
    );

    Ok(intensities
        .into_iter()
        .map(|(timestamp, intensity_mm_per_hr)| IntensityBin {
            timestamp,
            intensity_mm_per_hr,
        })
        .collect())
}

/// 1区間に集約した転倒の配分
#[derive(Debug, Clone, Copy, PartialEq)]
struct Allocation {
    /// 当該区間に加算する降雨強度
    current_rate: f64,
    /// 前の区間に加算する降雨強度
    backfill_rate: Option<f64>,
    /// 平均化期間に含まれる区間の数（当該区間を含む）
    periods_in_avg: i32,
}

/// 転倒回数と平均化期間から、当該区間と前の区間に配分する降雨強度を求める。
fn allocate(tips_in_bin: u32, avg_period: f64, bucket_depth_mm: f64) -> Allocation {
    let grid_minutes = GRID_MINUTES as f64;
    let tips_in_bin = f64::from(tips_in_bin);
    let spreads = grid_minutes < avg_period;

    let (current_rate, backfill_rate) = if 1.0 < tips_in_bin {
        if spreads {
            (
                (tips_in_bin - 1.0) * (MINUTES_PER_HOUR / grid_minutes) * bucket_depth_mm,
                Some(MINUTES_PER_HOUR / (avg_period - grid_minutes) * bucket_depth_mm),
            )
        } else {
            (
                tips_in_bin * (MINUTES_PER_HOUR / grid_minutes) * bucket_depth_mm,
                None,
            )
        }
    } else {
        // 1回の転倒は、前の区間にも当該区間と同じ降雨強度を配分する
        let rate = MINUTES_PER_HOUR / avg_period * bucket_depth_mm;
        (rate, spreads.then_some(rate))
    };

    Allocation {
        current_rate,
        backfill_rate,
        periods_in_avg: (avg_period / grid_minutes).ceil() as i32,
    }
}

/// 日時より後で最初の2分刻みの時刻を返す。
///
/// 日時が2分刻みの時刻と一致する場合は、その2分後を返す。
/// 表現できる範囲を超える場合は`None`を返す。
fn next_grid_point(dt: PrimitiveDateTime) -> Option<PrimitiveDateTime> {
    let grid_seconds = GRID_MINUTES * 60;
    let seconds = (dt.time() - Time::MIDNIGHT).whole_seconds();
    let floored = seconds - seconds.rem_euclid(grid_seconds);

    dt.date()
        .midnight()
        .checked_add(Duration::seconds(floored + grid_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn tip(timestamp: PrimitiveDateTime) -> TipEvent {
        TipEvent { timestamp }
    }

    fn assert_bins(actual: &[IntensityBin], expected: &[(PrimitiveDateTime, f64)]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?}");
        for (bin, (timestamp, intensity)) in actual.iter().zip(expected) {
            assert_eq!(bin.timestamp, *timestamp);
            assert!(
                (bin.intensity_mm_per_hr - intensity).abs() < 1e-9,
                "{}: {} != {intensity}",
                bin.timestamp,
                bin.intensity_mm_per_hr
            );
        }
    }

    #[test]
    fn grid_point_is_strictly_after_the_tip() {
        assert_eq!(
            next_grid_point(datetime!(2024-01-01 00:00:30)),
            Some(datetime!(2024-01-01 00:02))
        );
        assert_eq!(
            next_grid_point(datetime!(2024-01-01 00:02:00)),
            Some(datetime!(2024-01-01 00:04))
        );
        assert_eq!(
            next_grid_point(datetime!(2024-01-01 23:59:59)),
            Some(datetime!(2024-01-02 00:00))
        );
        assert_eq!(next_grid_point(datetime!(9999-12-31 23:59:00)), None);
    }

    #[test]
    fn no_tips_yield_empty_series() {
        assert!(reconstruct(&[], 0.2).unwrap().is_empty());
    }

    #[test]
    fn invalid_bucket_depth_is_rejected() {
        for depth in [0.0, -0.2, f64::NAN] {
            assert!(matches!(
                reconstruct(&[], depth),
                Err(RainfallError::InvalidBucketDepth(_))
            ));
        }
    }

    #[test]
    fn single_tip_spreads_over_ten_minutes() {
        let bins = reconstruct(&[tip(datetime!(2024-01-01 00:05:00))], 0.2).unwrap();
        assert_bins(
            &bins,
            &[
                (datetime!(2023-12-31 23:58), 1.2),
                (datetime!(2024-01-01 00:00), 1.2),
                (datetime!(2024-01-01 00:02), 1.2),
                (datetime!(2024-01-01 00:04), 1.2),
                (datetime!(2024-01-01 00:06), 1.2),
            ],
        );
    }

    #[test]
    fn clustered_first_tips_backfill_four_bins() {
        let tips = [
            tip(datetime!(2024-01-01 00:00:30)),
            tip(datetime!(2024-01-01 00:01:10)),
        ];
        let bins = reconstruct(&tips, 0.2).unwrap();
        assert_bins(
            &bins,
            &[
                (datetime!(2023-12-31 23:54), 1.5),
                (datetime!(2023-12-31 23:56), 1.5),
                (datetime!(2023-12-31 23:58), 1.5),
                (datetime!(2024-01-01 00:00), 1.5),
                (datetime!(2024-01-01 00:02), 6.0),
            ],
        );
    }

    #[test]
    fn long_gap_is_clamped_to_ten_minutes() {
        let tips = [
            tip(datetime!(2024-01-01 00:00:30)),
            tip(datetime!(2024-01-01 00:15:30)),
        ];
        let bins = reconstruct(&tips, 0.2).unwrap();
        assert_bins(
            &bins,
            &[
                (datetime!(2023-12-31 23:54), 1.2),
                (datetime!(2023-12-31 23:56), 1.2),
                (datetime!(2023-12-31 23:58), 1.2),
                (datetime!(2024-01-01 00:00), 1.2),
                (datetime!(2024-01-01 00:02), 1.2),
                (datetime!(2024-01-01 00:04), 0.0),
                (datetime!(2024-01-01 00:06), 0.0),
                (datetime!(2024-01-01 00:08), 1.2),
                (datetime!(2024-01-01 00:10), 1.2),
                (datetime!(2024-01-01 00:12), 1.2),
                (datetime!(2024-01-01 00:14), 1.2),
                (datetime!(2024-01-01 00:16), 1.2),
            ],
        );
    }

    #[test]
    fn short_gap_puts_every_tip_in_the_current_bin() {
        let tips = [
            tip(datetime!(2024-01-01 00:00:30)),
            tip(datetime!(2024-01-01 00:02:10)),
            tip(datetime!(2024-01-01 00:02:40)),
            tip(datetime!(2024-01-01 00:03:50)),
        ];
        let bins = reconstruct(&tips, 0.2).unwrap();
        let last = bins.last().unwrap();
        assert_eq!(last.timestamp, datetime!(2024-01-01 00:04));
        assert!((last.intensity_mm_per_hr - 18.0).abs() < 1e-9);
        // 最初の転倒の配分のみ
        assert_eq!(bins.len(), 6);
    }

    #[test]
    fn backfill_fills_bins_since_previous_tip() {
        let tips = [
            tip(datetime!(2024-01-01 00:00:30)),
            tip(datetime!(2024-01-01 00:06:30)),
        ];
        let bins = reconstruct(&tips, 0.2).unwrap();
        // 2回目の転倒は6分後、平均化期間6分、3区間に配分
        let rate = 60.0 / 6.0 * 0.2;
        assert_bins(
            &bins,
            &[
                (datetime!(2023-12-31 23:54), 1.2),
                (datetime!(2023-12-31 23:56), 1.2),
                (datetime!(2023-12-31 23:58), 1.2),
                (datetime!(2024-01-01 00:00), 1.2),
                (datetime!(2024-01-01 00:02), 1.2),
                (datetime!(2024-01-01 00:04), rate),
                (datetime!(2024-01-01 00:06), rate),
                (datetime!(2024-01-01 00:08), rate),
            ],
        );
    }

    #[test]
    fn clustered_tips_after_short_gap_backfill_since_previous_tip() {
        let tips = [
            tip(datetime!(2024-01-01 00:00:30)),
            tip(datetime!(2024-01-01 00:06:10)),
            tip(datetime!(2024-01-01 00:07:00)),
        ];
        let bins = reconstruct(&tips, 0.2).unwrap();
        // 平均化期間6分: 当該区間に(2-1)*30*0.2、前の2区間に60/(6-2)*0.2
        assert_bins(
            &bins,
            &[
                (datetime!(2023-12-31 23:54), 1.2),
                (datetime!(2023-12-31 23:56), 1.2),
                (datetime!(2023-12-31 23:58), 1.2),
                (datetime!(2024-01-01 00:00), 1.2),
                (datetime!(2024-01-01 00:02), 1.2),
                (datetime!(2024-01-01 00:04), 3.0),
                (datetime!(2024-01-01 00:06), 3.0),
                (datetime!(2024-01-01 00:08), 6.0),
            ],
        );
    }

    #[test]
    fn single_tip_in_adjacent_bin_has_no_backfill() {
        let tips = [
            tip(datetime!(2024-01-01 00:00:30)),
            tip(datetime!(2024-01-01 00:02:30)),
        ];
        let bins = reconstruct(&tips, 0.2).unwrap();
        assert_bins(
            &bins,
            &[
                (datetime!(2023-12-31 23:54), 1.2),
                (datetime!(2023-12-31 23:56), 1.2),
                (datetime!(2023-12-31 23:58), 1.2),
                (datetime!(2024-01-01 00:00), 1.2),
                (datetime!(2024-01-01 00:02), 1.2),
                (datetime!(2024-01-01 00:04), 6.0),
            ],
        );
    }

    #[test]
    fn tip_at_end_of_representable_range_is_an_error() {
        let result = reconstruct(&[tip(datetime!(9999-12-31 23:59:00))], 0.2);
        assert!(matches!(
            result,
            Err(RainfallError::DateTimeOverflow(dt)) if dt == datetime!(9999-12-31 23:59:00)
        ));

        let bins = reconstruct(&[tip(datetime!(9999-12-31 23:57:00))], 0.2).unwrap();
        assert_eq!(bins.len(), 5);
        assert_eq!(bins[4].timestamp, datetime!(9999-12-31 23:58));
    }

    #[test]
    fn reconstruction_is_deterministic() {
        let tips: Vec<_> = [0i64, 40, 95, 700, 712, 2_000]
            .into_iter()
            .map(|s| tip(datetime!(2024-06-01 12:00) + Duration::seconds(s)))
            .collect();
        let first = reconstruct(&tips, 0.5).unwrap();
        let second = reconstruct(&tips, 0.5).unwrap();
        assert_eq!(first, second);
        assert!(first.iter().all(|bin| 0.0 <= bin.intensity_mm_per_hr));
        assert!(first
            .windows(2)
            .all(|w| w[1].timestamp - w[0].timestamp == Duration::minutes(2)));
    }
}
