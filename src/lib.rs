//! 現地テレメトリ・ロガー（水位、流速、電圧、転倒ます雨量計、ポンプ運転状態）が出力する
//! ファイルを読み込み、時系列データに変換する。
//!
//! 転倒ます雨量計の転倒イベントは2分間隔の降雨強度系列に再構成し、水理解析ツールが
//! 読み込む`.r`形式のファイルとして出力できる。

use time::PrimitiveDateTime;

pub mod config;
pub mod pump;
pub mod rainfall;
pub mod readers;
pub mod writers;

/// 数値系列の1観測値
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericSample {
    /// 観測日時
    pub timestamp: PrimitiveDateTime,

    /// 観測値
    ///
    /// 欠測の場合は`None`。
    pub value: Option<f64>,
}

/// 転倒ます雨量計の1回の転倒
///
/// 1回の転倒が示す雨量は、ファイルに記録されていないため設定で与える。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TipEvent {
    /// 転倒日時
    pub timestamp: PrimitiveDateTime,
}

/// 2分間隔の降雨強度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityBin {
    /// 2分間の終了日時
    pub timestamp: PrimitiveDateTime,

    /// 降雨強度（mm/hr）
    pub intensity_mm_per_hr: f64,
}

/// ポンプ運転状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStateSample {
    /// 記録日時
    pub timestamp: PrimitiveDateTime,

    /// 運転状態
    pub state: i64,
}
