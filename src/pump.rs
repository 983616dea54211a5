use std::fs::OpenOptions;
use std::io::{BufReader, Read};
use std::path::Path;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Month, PrimitiveDateTime, Time};
use tracing::debug;

use crate::PumpStateSample;

/// ポンプ運転状態の単位
pub const PUMP_UNITS: &str = "on/off";

/// 記録日時の時刻部分の書式（12時間表記）
const TIME_FMT: &[FormatItem<'_>] = format_description!(
    "[hour repr:12 padding:none]:[minute]:[second] [period case_sensitive:false]"
);

/// 2桁の西暦年を1900年代とみなす最小値
///
/// 69から99は1900年代、00から68は2000年代とする。
const TWENTIETH_CENTURY_PIVOT: i32 = 69;

/// ポンプ運転状態の系列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpSeries {
    /// 単位
    pub units: &'static str,

    /// 運転状態
    pub samples: Vec<PumpStateSample>,
}

/// PumpCsvエラー型
#[derive(Debug, Clone, thiserror::Error)]
pub enum PumpCsvError {
    /// ファイル・オープン・エラー
    #[error("ファイルを開くときにエラーが発生しました。{0}")]
    Open(String),

    /// CSVの読み込みエラー
    #[error("CSVの読み込みに失敗しました。{0}")]
    Csv(String),

    /// 記録日時を解釈できない
    #[error("{row}行目の記録日時を解釈できません。`{value}`")]
    Timestamp { row: usize, value: String },
}

/// PumpCsv結果型
pub type PumpCsvResult<T> = Result<T, PumpCsvError>;

/// ポンプ運転状態を記録したCSVファイルを読み込む。
pub fn read_pump_csv<P>(path: P) -> PumpCsvResult<PumpSeries>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| PumpCsvError::Open(format!("{}: {e}", path.display())))?;

    decode(BufReader::new(file))
}

/// 文字列からポンプ運転状態を読み込む。
pub fn decode_str(text: &str) -> PumpCsvResult<PumpSeries> {
    decode(text.as_bytes())
}

/// リーダーからポンプ運転状態を読み込む。
pub fn decode<R>(reader: R) -> PumpCsvResult<PumpSeries>
where
    R: Read,
{
    decode_with_progress(reader, 0, |_| {})
}

/// 進捗を通知しながら、リーダーからポンプ運転状態を読み込む。
///
/// 2列目が記録日時、3列目が運転状態である。運転状態を数値として解釈できない行は、
/// 表題や見出しの行とみなして読み飛ばす。空行または1列目が空の行に達した時点で
/// 読み込みを終了し、それ以降の行は読み込まない。
///
/// # 引数
///
/// * `reader` - CSVを読み込むリーダー
/// * `every` - 進捗を通知する行数の間隔（0の場合は通知しない）
/// * `on_progress` - 読み込んだ行数を受け取るコールバック
///
/// # 戻り値
///
/// 単位と運転状態
pub fn decode_with_progress<R, F>(
    reader: R,
    every: usize,
    mut on_progress: F,
) -> PumpCsvResult<PumpSeries>
where
    R: Read,
    F: FnMut(usize),
{
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut record = csv::StringRecord::new();
    let mut samples = Vec::new();
    let mut row = 0usize;
    let mut skipped = 0usize;
    // 次のレコードが始まるはずの行番号
    let mut expected_line = 1u64;

    while csv_reader
        .read_record(&mut record)
        .map_err(|e| PumpCsvError::Csv(format!("{e}")))?
    {
        // csvクレートは空行を読み飛ばすため、行番号の飛びで空行を検出する
        if let Some(position) = record.position() {
            if position.line() > expected_line {
                debug!(line = expected_line, "空行に達したため、読み込みを終了します");
                break;
            }
            expected_line = position.line() + 1 + newlines_in(&record);
        }
        row += 1;
        if every > 0 && row % every == 0 {
            on_progress(row);
        }
        if record.get(0).is_some_and(str::is_empty) {
            debug!(row, "1列目が空の行に達したため、読み込みを終了します");
            break;
        }
        let Some(state) = record.get(2).and_then(parse_state) else {
            skipped += 1;
            continue;
        };
        let value = record.get(1).unwrap_or_default();
        let timestamp = parse_timestamp(value).ok_or_else(|| PumpCsvError::Timestamp {
            row,
            value: value.to_string(),
        })?;
        samples.push(PumpStateSample { timestamp, state });
    }
    debug!(samples = samples.len(), skipped, "ポンプ運転状態を読み込みました");

    Ok(PumpSeries {
        units: PUMP_UNITS,
        samples,
    })
}

/// 引用符で囲まれたフィールドに含まれる改行の数を返す。
fn newlines_in(record: &csv::StringRecord) -> u64 {
    record
        .iter()
        .map(|field| field.matches('\n').count() as u64)
        .sum()
}

/// 運転状態を浮動小数点数として解釈して、整数部を返す。
fn parse_state(value: &str) -> Option<i64> {
    let value = value.trim().parse::<f64>().ok()?;
    if value.is_finite() {
        Some(value.trunc() as i64)
    } else {
        None
    }
}

/// `MM/DD/YY hh:mm:ss AM`形式の記録日時を解釈する。
fn parse_timestamp(value: &str) -> Option<PrimitiveDateTime> {
    let (date_part, time_part) = value.trim().split_once(' ')?;
    let mut parts = date_part.split('/');
    let month = parts.next()?.parse::<u8>().ok()?;
    let day = parts.next()?.parse::<u8>().ok()?;
    let year = parts.next()?.parse::<i32>().ok()?;
    if parts.next().is_some() || !(0..100).contains(&year) {
        return None;
    }
    let year = if year < TWENTIETH_CENTURY_PIVOT {
        2000 + year
    } else {
        1900 + year
    };
    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let time = Time::parse(time_part.trim(), TIME_FMT).ok()?;

    Some(PrimitiveDateTime::new(date, time))
}
