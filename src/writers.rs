use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Month, PrimitiveDateTime, Time};
use tracing::debug;

use crate::rainfall::GRID_MINUTES;
use crate::{IntensityBin, NumericSample};

/// `.r`ファイルの日時の書式
const RAINFALL_DATETIME_FMT: &[FormatItem<'_>] =
    format_description!("[year repr:last_two][month][day][hour][minute]");

/// CSVファイルの日時の書式
const CSV_DATETIME_FMT: &[FormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// 1行に記録する降雨強度の数
const VALUES_PER_LINE: usize = 5;

/// 降雨強度を記録する桁数
const VALUE_WIDTH: usize = 15;

/// 先行降雨量の日数
const ANTECEDENT_DAYS: usize = 30;

/// 先行降雨量の未設定値を1行に記録する数
const PLACEHOLDERS_PER_LINE: usize = 15;

/// 先行降雨量の未設定値
const PLACEHOLDER: f64 = -1.0;

/// `**CONSTANTS`の継続行1行に記録する定数名の数
const NAMES_PER_LINE: usize = 5;

/// キーワードの桁数
const KEYWORD_WIDTH: usize = 24;

const CONSTANTS_START: &str = "*CSTART";
const CONSTANTS_END: &str = "*CEND";
const END: &str = "*END";

/// Writerエラー型
#[derive(Debug, Clone, thiserror::Error)]
pub enum WriterError {
    /// ファイル・オープン・エラー
    #[error("ファイルを開くときにエラーが発生しました。{0}")]
    Open(String),

    /// 書き込みエラー
    #[error("書き込みに失敗しました。{0}")]
    Write(String),

    /// 日時の書式化エラー
    #[error("日時を書式化できませんでした。{0}")]
    Format(String),

    /// `.r`ファイルの解析エラー
    #[error("{line}行目を解析できません。{message}")]
    Parse { line: usize, message: String },
}

/// Writer結果型
pub type WriterResult<T> = Result<T, WriterError>;

/// 降雨強度を`.r`形式で書き込む。
///
/// # 引数
///
/// * `writer` - 書き込み先
/// * `series` - 降雨強度
/// * `identifier` - 雨量計の識別子
/// * `start` - 記録開始日時
/// * `end` - 記録終了日時
pub fn write_rainfall<W>(
    writer: &mut W,
    series: &[IntensityBin],
    identifier: &str,
    start: PrimitiveDateTime,
    end: PrimitiveDateTime,
) -> WriterResult<()>
where
    W: Write,
{
    let start = start
        .format(RAINFALL_DATETIME_FMT)
        .map_err(|e| WriterError::Format(format!("{e}")))?;
    let end = end
        .format(RAINFALL_DATETIME_FMT)
        .map_err(|e| WriterError::Format(format!("{e}")))?;

    let mut lines = header_lines(identifier);
    lines.push(CONSTANTS_START.to_string());
    lines.push(identifier.to_string());
    let placeholder = format!("{PLACEHOLDER:>6.1}").repeat(PLACEHOLDERS_PER_LINE);
    for _ in 0..ANTECEDENT_DAYS / PLACEHOLDERS_PER_LINE {
        lines.push(placeholder.clone());
    }
    lines.push(format!("{start}  {end}{GRID_MINUTES:>5}"));
    lines.push(CONSTANTS_END.to_string());
    for values in series.chunks(VALUES_PER_LINE) {
        lines.push(
            values
                .iter()
                .map(|bin| format!("{:>VALUE_WIDTH$.1}", bin.intensity_mm_per_hr))
                .collect(),
        );
    }
    lines.push(END.to_string());

    for line in lines {
        writeln!(writer, "{line}").map_err(|e| WriterError::Write(format!("{e}")))?;
    }
    debug!(identifier, values = series.len(), "降雨強度を書き込みました");

    Ok(())
}

/// 降雨強度を`.r`形式のバイト列に変換する。
pub fn encode_rainfall(
    series: &[IntensityBin],
    identifier: &str,
    start: PrimitiveDateTime,
    end: PrimitiveDateTime,
) -> WriterResult<Vec<u8>> {
    let mut buf = Vec::new();
    write_rainfall(&mut buf, series, identifier, start, end)?;

    Ok(buf)
}

/// 書き込み用にファイルを開く。
///
/// 親ディレクトリが存在しない場合は作成し、ファイルが存在する場合は上書きする。
fn create_file(path: &Path) -> WriterResult<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| WriterError::Open(format!("{}: {e}", parent.display())))?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| WriterError::Open(format!("{}: {e}", path.display())))
}

/// 降雨強度を`.r`ファイルに書き込む。
///
/// 親ディレクトリが存在しない場合は作成し、ファイルが存在する場合は上書きする。
pub fn write_rainfall_file<P>(
    path: P,
    series: &[IntensityBin],
    identifier: &str,
    start: PrimitiveDateTime,
    end: PrimitiveDateTime,
) -> WriterResult<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let mut writer = BufWriter::new(create_file(path)?);
    write_rainfall(&mut writer, series, identifier, start, end)?;
    writer
        .flush()
        .map_err(|e| WriterError::Write(format!("{}: {e}", path.display())))
}

/// `.r`ファイルのヘッダ部の行を構築する。
fn header_lines(identifier: &str) -> Vec<String> {
    let mut names = vec!["LOCATION".to_string()];
    names.extend((0..ANTECEDENT_DAYS).map(|day| format!("{day}_DAY_RAINFALL")));
    names.extend(["START", "END", "INTERVAL"].map(String::from));
    let mut units = vec![String::new()];
    units.extend((0..ANTECEDENT_DAYS).map(|_| "MM".to_string()));
    units.extend(["GMT", "GMT", "MIN"].map(String::from));

    let mut lines = vec![
        keyword_line("**DATA_FORMAT:", "1,ASCII"),
        keyword_line("**IDENTIFIER:", &format!("1,{identifier}")),
        keyword_line("**FIELD:", "1,INTENSITY"),
        keyword_line("**UNITS:", "1,MM/HR"),
        keyword_line("**FORMAT:", &format!("2,F{VALUE_WIDTH}.1,[{VALUES_PER_LINE}]")),
        keyword_line("**RECORD_LENGTH:", &format!("I2,{}", VALUE_WIDTH * VALUES_PER_LINE)),
    ];
    let count = names.len();
    for (i, chunk) in names.chunks(NAMES_PER_LINE).enumerate() {
        let mut value = chunk.join(",");
        if i == 0 {
            value = format!("{count},{value}");
        }
        if (i + 1) * NAMES_PER_LINE < count {
            value.push(',');
        }
        let keyword = if i == 0 { "**CONSTANTS:" } else { "*+" };
        lines.push(keyword_line(keyword, &value));
    }
    lines.push(keyword_line("**C_UNITS:", &format!("{count},{}", units.join(","))));
    lines.push(keyword_line(
        "**C_FORMAT:",
        &format!(
            "7,A20/{PLACEHOLDERS_PER_LINE}F6.1/{PLACEHOLDERS_PER_LINE}F6.1/D10,2X,D10,I5"
        ),
    ));

    lines
}

fn keyword_line(keyword: &str, value: &str) -> String {
    format!("{keyword:<KEYWORD_WIDTH$}{value}")
}

/// `.r`ファイルの内容
#[derive(Debug, Clone, PartialEq)]
pub struct RainfallInterchange {
    /// 雨量計の識別子
    pub identifier: String,

    /// 記録開始日時
    pub start: PrimitiveDateTime,

    /// 記録終了日時
    pub end: PrimitiveDateTime,

    /// 記録間隔（分）
    pub interval_minutes: i64,

    /// 降雨強度（mm/hr）
    pub values: Vec<f64>,
}

/// `.r`形式の文字列を解析する。
///
/// `*CSTART`から`*CEND`までの定数と、`*CEND`から`*END`までの降雨強度を読み込む。
pub fn read_rainfall(text: &str) -> WriterResult<RainfallInterchange> {
    let mut lines = text.lines().enumerate().map(|(i, line)| (i + 1, line));
    let parse_error = |line: usize, message: &str| WriterError::Parse {
        line,
        message: message.to_string(),
    };

    lines
        .by_ref()
        .find(|(_, line)| line.trim_end() == CONSTANTS_START)
        .ok_or_else(|| parse_error(0, "`*CSTART`が見つかりません。"))?;
    let mut constants = Vec::new();
    let mut end_of_constants = None;
    for (number, line) in lines.by_ref() {
        if line.trim_end() == CONSTANTS_END {
            end_of_constants = Some(number);
            break;
        }
        constants.push((number, line));
    }
    let end_of_constants =
        end_of_constants.ok_or_else(|| parse_error(0, "`*CEND`が見つかりません。"))?;
    let (_, identifier) = constants
        .first()
        .ok_or_else(|| parse_error(end_of_constants, "識別子がありません。"))?;
    let (number, period) = constants
        .last()
        .filter(|_| 1 < constants.len())
        .ok_or_else(|| parse_error(end_of_constants, "記録期間がありません。"))?;
    let mut fields = period.split_whitespace();
    let mut next_field = |name: &str| {
        fields
            .next()
            .ok_or_else(|| parse_error(*number, &format!("{name}がありません。")))
    };
    let start = parse_rainfall_datetime(next_field("記録開始日時")?)
        .ok_or_else(|| parse_error(*number, "記録開始日時を解釈できません。"))?;
    let end = parse_rainfall_datetime(next_field("記録終了日時")?)
        .ok_or_else(|| parse_error(*number, "記録終了日時を解釈できません。"))?;
    let interval_minutes = next_field("記録間隔")?
        .parse::<i64>()
        .map_err(|e| parse_error(*number, &format!("記録間隔を解釈できません。{e}")))?;

    let mut values = Vec::new();
    for (number, line) in lines {
        if line.trim_end() == END {
            return Ok(RainfallInterchange {
                identifier: identifier.trim_end().to_string(),
                start,
                end,
                interval_minutes,
                values,
            });
        }
        for field in line.as_bytes().chunks(VALUE_WIDTH) {
            let field = std::str::from_utf8(field)
                .map_err(|e| parse_error(number, &format!("{e}")))?
                .trim();
            let value = field
                .parse::<f64>()
                .map_err(|e| parse_error(number, &format!("`{field}`: {e}")))?;
            values.push(value);
        }
    }

    Err(parse_error(0, "`*END`が見つかりません。"))
}

/// `YYMMDDHHMM`形式の日時を解釈する。
fn parse_rainfall_datetime(value: &str) -> Option<PrimitiveDateTime> {
    if value.len() != 10 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let part = |i: usize| value[i..i + 2].parse::<u8>().ok();
    let year = i32::from(part(0)?);
    let year = if year < 69 { 2000 + year } else { 1900 + year };
    let date = Date::from_calendar_date(year, Month::try_from(part(2)?).ok()?, part(4)?).ok()?;
    let time = Time::from_hms(part(6)?, part(8)?, 0).ok()?;

    Some(PrimitiveDateTime::new(date, time))
}

/// 観測値を`Timestamp,Value`形式のCSVで書き込む。
///
/// 欠測は空欄とする。
pub fn write_numeric_csv<W>(writer: W, samples: &[NumericSample]) -> WriterResult<()>
where
    W: Write,
{
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record(["Timestamp", "Value"])
        .map_err(|e| WriterError::Write(format!("{e}")))?;
    for sample in samples {
        let timestamp = sample
            .timestamp
            .format(CSV_DATETIME_FMT)
            .map_err(|e| WriterError::Format(format!("{e}")))?;
        let value = sample.value.map(|v| v.to_string()).unwrap_or_default();
        csv_writer
            .write_record([timestamp, value])
            .map_err(|e| WriterError::Write(format!("{e}")))?;
    }
    csv_writer
        .flush()
        .map_err(|e| WriterError::Write(format!("{e}")))
}

/// 観測値を`Timestamp,Value`形式のCSVファイルに書き込む。
///
/// 親ディレクトリが存在しない場合は作成する。
pub fn write_numeric_csv_file<P>(path: P, samples: &[NumericSample]) -> WriterResult<()>
where
    P: AsRef<Path>,
{
    write_numeric_csv(BufWriter::new(create_file(path.as_ref())?), samples)
}

/// 降雨強度を`Date,IntensityData`形式のCSVで書き込む。
pub fn write_intensity_csv<W>(writer: W, series: &[IntensityBin]) -> WriterResult<()>
where
    W: Write,
{
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record(["Date", "IntensityData"])
        .map_err(|e| WriterError::Write(format!("{e}")))?;
    for bin in series {
        let timestamp = bin
            .timestamp
            .format(CSV_DATETIME_FMT)
            .map_err(|e| WriterError::Format(format!("{e}")))?;
        csv_writer
            .write_record([timestamp, bin.intensity_mm_per_hr.to_string()])
            .map_err(|e| WriterError::Write(format!("{e}")))?;
    }
    csv_writer
        .flush()
        .map_err(|e| WriterError::Write(format!("{e}")))
}
