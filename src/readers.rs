use std::fs::OpenOptions;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use time::{Date, Duration, Month, PrimitiveDateTime, Time};
use tracing::{debug, info, warn};

use crate::{NumericSample, TipEvent};

/// ヘッダ部のバイト数
pub const HEADER_BYTES: usize = 78;

/// 識別子のバイト数
const IDENTIFIER_BYTES: usize = 30;

/// 観測種別のバイト数
const MEASUREMENT_TYPE_BYTES: usize = 15;

/// 単位のバイト数
const UNITS_BYTES: usize = 10;

/// 記録間隔の単位（0.1秒）を分に変換するための除数
const TENTHS_OF_SECOND_PER_MINUTE: u16 = 600;

/// 転倒イベントの欠測値
pub const TIP_SENTINEL: u32 = u32::MAX;

/// `DatReader`
///
/// ロガーが出力した`.dat`ファイルを読み込み、デコードした結果を保持する。
#[derive(Debug, Clone)]
pub struct DatReader {
    /// パス
    path: PathBuf,
    /// デコード結果
    logger_file: LoggerFile,
}

impl DatReader {
    /// `.dat`ファイルを開いてデコードする。
    ///
    /// # 引数
    ///
    /// * `path` - 開く`.dat`ファイルのパス
    ///
    /// # 戻り値
    ///
    /// `DatReader`
    pub fn new<P>(path: P) -> DatReaderResult<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| DatReaderError::Open(format!("{}: {e}", path.display())))?;
        let mut reader = BufReader::new(file);
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| DatReaderError::Read(format!("{}: {e}", path.display())))?;
        let logger_file = decode(&bytes)?;
        info!(
            path = %path.display(),
            identifier = %logger_file.header.identifier,
            "ロガー・ファイルを読み込みました"
        );

        Ok(Self { path, logger_file })
    }

    /// 読み込んだファイルのパスを返す。
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ヘッダを返す。
    pub fn header(&self) -> &LoggerHeader {
        &self.logger_file.header
    }

    /// ヘッダ - 識別子を返す。
    pub fn identifier(&self) -> &str {
        &self.logger_file.header.identifier
    }

    /// ヘッダ - 記録形式を返す。
    pub fn encoding_flag(&self) -> EncodingFlag {
        self.logger_file.header.encoding_flag
    }

    /// ヘッダ - 記録開始日時を返す。
    pub fn start_date_time(&self) -> PrimitiveDateTime {
        self.logger_file.header.start_date_time
    }

    /// ヘッダ - 記録間隔を分単位で返す。
    pub fn interval_minutes(&self) -> u16 {
        self.logger_file.header.interval_minutes
    }

    /// デコードした系列を返す。
    pub fn series(&self) -> &LoggerSeries {
        &self.logger_file.series
    }

    /// `DatReader`を消費して、デコード結果を返す。
    pub fn into_logger_file(self) -> LoggerFile {
        self.logger_file
    }
}

/// 記録形式
///
/// 1レコードのバイト数とデコード方法を決定する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingFlag {
    /// 1バイト符号なし整数（255以上は欠測）
    Byte = 2,

    /// 2バイト符号なし整数（32767以上は欠測）
    Word = 8,

    /// 4バイト符号なし整数で記録された、記録開始からの転倒秒数
    Tip = 17,
}

impl EncodingFlag {
    /// 1レコードのバイト数を返す。
    pub fn record_bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Tip => 4,
        }
    }

    /// 校正値への換算に使用する閾値を返す。
    ///
    /// 閾値以上の値は欠測を示す。転倒イベントは閾値を持たない。
    pub fn threshold(self) -> Option<u32> {
        match self {
            Self::Byte => Some(255),
            Self::Word => Some(32767),
            Self::Tip => None,
        }
    }
}

/// `u8`型から記録形式を示す`EncodingFlag`に変換する。
impl TryFrom<u8> for EncodingFlag {
    type Error = DatReaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Byte),
            8 => Ok(Self::Word),
            17 => Ok(Self::Tip),
            _ => Err(DatReaderError::UnsupportedEncoding(value)),
        }
    }
}

/// ヘッダ部
#[derive(Debug, Clone, PartialEq)]
pub struct LoggerHeader {
    /// 識別子
    pub identifier: String,

    /// 記録形式
    pub encoding_flag: EncodingFlag,

    /// 記録開始日時
    pub start_date_time: PrimitiveDateTime,

    /// 記録間隔（分）
    ///
    /// ファイルには0.1秒単位で記録されており、600で除した整数部を分とする。
    pub interval_minutes: u16,

    /// 観測種別
    pub measurement_type: String,

    /// 単位
    pub units: String,

    /// 校正値の最小値
    pub calibration_min: f32,

    /// 校正値の最大値
    pub calibration_max: f32,
}

/// デコードした系列
#[derive(Debug, Clone, PartialEq)]
pub enum LoggerSeries {
    /// 記録間隔ごとの観測値
    Numeric(Vec<NumericSample>),

    /// 転倒イベント
    Tips(Vec<TipEvent>),
}

impl LoggerSeries {
    /// 系列の要素数を返す。
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(samples) => samples.len(),
            Self::Tips(tips) => tips.len(),
        }
    }

    /// 系列が空の場合は`true`を返す。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// ロガー・ファイルのデコード結果
#[derive(Debug, Clone, PartialEq)]
pub struct LoggerFile {
    /// ヘッダ部
    pub header: LoggerHeader,

    /// データ部
    pub series: LoggerSeries,
}

/// DatReaderエラー型
#[derive(Debug, Clone, thiserror::Error)]
pub enum DatReaderError {
    /// ファイル・オープン・エラー
    #[error("ファイルを開くときにエラーが発生しました。{0}")]
    Open(String),

    /// ファイル読み込みエラー
    #[error("ファイルの読み込みに失敗しました。{0}")]
    Read(String),

    /// ヘッダ部に満たないバイト数
    #[error("ヘッダ部を読み込むためのバイト数が不足しています。`{0}`バイト")]
    TruncatedHeader(usize),

    /// サポートしていない記録形式
    #[error("サポートしていない記録形式です。`{0}`")]
    UnsupportedEncoding(u8),

    /// 記録開始日時が不正
    #[error("ファイルに記録されている記録開始日時が不正です。{0}")]
    InvalidStartDateTime(String),

    /// レコードの日時が表現できる範囲を超えた
    #[error("{0}番目のレコードの日時が表現できる範囲を超えています。")]
    DateTimeOverflow(usize),
}

/// DatReader結果型
pub type DatReaderResult<T> = Result<T, DatReaderError>;

/// ロガー・ファイルのバイト列をデコードする。
///
/// # 引数
///
/// * `bytes` - ファイル全体のバイト列
///
/// # 戻り値
///
/// ヘッダ部と系列
pub fn decode(bytes: &[u8]) -> DatReaderResult<LoggerFile> {
    decode_with_progress(bytes, 0, |_| {})
}

/// 進捗を通知しながら、ロガー・ファイルのバイト列をデコードする。
///
/// `on_progress`は`every`レコードを処理するごとに、処理済みのレコード数を引数に呼び出される。
/// `every`が0の場合は呼び出されない。通知の有無はデコード結果に影響しない。
///
/// # 引数
///
/// * `bytes` - ファイル全体のバイト列
/// * `every` - 進捗を通知するレコード数の間隔
/// * `on_progress` - 進捗を受け取るコールバック
///
/// # 戻り値
///
/// ヘッダ部と系列
pub fn decode_with_progress<F>(
    bytes: &[u8],
    every: usize,
    mut on_progress: F,
) -> DatReaderResult<LoggerFile>
where
    F: FnMut(usize),
{
    if bytes.len() < HEADER_BYTES {
        return Err(DatReaderError::TruncatedHeader(bytes.len()));
    }
    let mut reader = Cursor::new(bytes);
    let header = read_header(&mut reader)?;
    debug!(
        identifier = %header.identifier,
        encoding_flag = ?header.encoding_flag,
        interval_minutes = header.interval_minutes,
        "ヘッダ部を読み込みました"
    );

    let record_bytes = header.encoding_flag.record_bytes();
    let mut processed = 0usize;
    let mut report = |processed: usize| {
        if every > 0 && processed % every == 0 {
            on_progress(processed);
        }
    };

    let series = match header.encoding_flag.threshold() {
        Some(threshold) => {
            let interval = Duration::minutes(i64::from(header.interval_minutes));
            let span = f64::from(header.calibration_max) - f64::from(header.calibration_min);
            let mut samples = Vec::with_capacity(remaining(&reader) / record_bytes);
            let mut missing = 0usize;
            while record_bytes <= remaining(&reader) {
                let raw = match header.encoding_flag {
                    EncodingFlag::Byte => u32::from(read_u8(&mut reader)?),
                    _ => u32::from(read_u16(&mut reader)?),
                };
                let value = if threshold <= raw {
                    missing += 1;
                    None
                } else {
                    let scaled = f64::from(header.calibration_min)
                        + span * (f64::from(raw) / f64::from(threshold));
                    Some(round_to_thousandths(scaled))
                };
                let offset = i32::try_from(processed)
                    .ok()
                    .and_then(|i| interval.checked_mul(i))
                    .ok_or(DatReaderError::DateTimeOverflow(processed))?;
                let timestamp = header
                    .start_date_time
                    .checked_add(offset)
                    .ok_or(DatReaderError::DateTimeOverflow(processed))?;
                samples.push(NumericSample { timestamp, value });
                processed += 1;
                report(processed);
            }
            debug!(records = samples.len(), missing, "観測値をデコードしました");
            LoggerSeries::Numeric(samples)
        }
        None => {
            let mut tips = Vec::with_capacity(remaining(&reader) / record_bytes);
            let mut sentinels = 0usize;
            while record_bytes <= remaining(&reader) {
                let raw = read_u32(&mut reader)?;
                if raw == TIP_SENTINEL {
                    sentinels += 1;
                } else {
                    let timestamp = header
                        .start_date_time
                        .checked_add(Duration::seconds(i64::from(raw)))
                        .ok_or(DatReaderError::DateTimeOverflow(processed))?;
                    tips.push(TipEvent { timestamp });
                }
                processed += 1;
                report(processed);
            }
            debug!(tips = tips.len(), sentinels, "転倒イベントをデコードしました");
            LoggerSeries::Tips(tips)
        }
    };

    let trailing = remaining(&reader);
    if 0 < trailing {
        debug!(trailing, "レコードに満たない末尾のバイトを破棄しました");
    }

    Ok(LoggerFile { header, series })
}

/// 複数の`.dat`ファイルを順に読み込む。
///
/// 読み込みに失敗したファイルがあっても中断せず、残りのファイルを読み込む。
///
/// # 引数
///
/// * `paths` - 読み込むファイルのパス
///
/// # 戻り値
///
/// ファイルのパスと読み込み結果の組
pub fn decode_files<I, P>(paths: I) -> Vec<(PathBuf, DatReaderResult<DatReader>)>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    paths
        .into_iter()
        .map(|path| {
            let path = path.as_ref().to_owned();
            let result = DatReader::new(&path);
            if let Err(e) = &result {
                warn!(path = %path.display(), error = %e, "ロガー・ファイルを読み込めませんでした");
            }
            (path, result)
        })
        .collect()
}

fn remaining(reader: &Cursor<&[u8]>) -> usize {
    let position = usize::try_from(reader.position()).unwrap_or(usize::MAX);
    reader.get_ref().len().saturating_sub(position)
}

fn round_to_thousandths(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// 文字列を読み込む。
///
/// 読み込んだ文字列は、末尾のNUL文字を取り除いた結果である。
/// UTF-8として解釈できない場合は、1バイト文字コード（ISO-8859-1）として解釈する。
///
/// # 引数
///
/// * `reader` - 文字列を読み込むリーダー
/// * `bytes` - 読み込むバイト数
///
/// # 戻り値
///
/// 読み込んだ文字列
fn read_str<R>(reader: &mut R, bytes: usize) -> DatReaderResult<String>
where
    R: Read,
{
    let mut buf = vec![0u8; bytes];
    reader.read_exact(&mut buf).map_err(|e| {
        DatReaderError::Read(format!("ファイルから{bytes}バイトの読み込みに失敗しました。{e}"))
    })?;
    let s = match String::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => {
            debug!("UTF-8として解釈できないため、1バイト文字コードとして解釈します。{e}");
            e.into_bytes().into_iter().map(char::from).collect()
        }
    };

    Ok(s.trim_end_matches('\0').to_string())
}

macro_rules! read_number {
    ($func_name:ident, $type: ty) => {
        fn $func_name<R>(reader: &mut R) -> DatReaderResult<$type>
        where
            R: Read,
        {
            let mut buf = [0u8; std::mem::size_of::<$type>()];
            reader.read_exact(&mut buf).map_err(|e| {
                DatReaderError::Read(format!(
                    "ファイルから{}バイトの読み込みに失敗しました。{e}",
                    buf.len()
                ))
            })?;

            Ok(<$type>::from_le_bytes(buf))
        }
    };
}

read_number!(read_u8, u8);
read_number!(read_u16, u16);
read_number!(read_u32, u32);
read_number!(read_f32, f32);

fn read_date_time<R>(reader: &mut R) -> DatReaderResult<PrimitiveDateTime>
where
    R: Read,
{
    let year = read_u16(reader)?;
    let month = read_u16(reader)?;
    let day = read_u16(reader)?;
    let hour = read_u16(reader)?;
    let minute = read_u16(reader)?;
    let second = read_u16(reader)?;

    let narrow = |name: &str, value: u16| {
        u8::try_from(value).map_err(|_| {
            DatReaderError::InvalidStartDateTime(format!("{name}({value})が範囲外です。"))
        })
    };
    let month_enum = Month::try_from(narrow("月", month)?).map_err(|e| {
        DatReaderError::InvalidStartDateTime(format!(
            "ファイルに記録されている月({month})が不正です。{e}"
        ))
    })?;
    let date = Date::from_calendar_date(i32::from(year), month_enum, narrow("日", day)?)
        .map_err(|e| {
            DatReaderError::InvalidStartDateTime(format!(
                "ファイルに記録されている年月日から、日付を構築できませんでした。{e}"
            ))
        })?;
    let time = Time::from_hms(
        narrow("時", hour)?,
        narrow("分", minute)?,
        narrow("秒", second)?,
    )
    .map_err(|e| {
        DatReaderError::InvalidStartDateTime(format!(
            "ファイルに記録されている時分秒から、時刻を構築できませんでした。{e}"
        ))
    })?;

    Ok(PrimitiveDateTime::new(date, time))
}

fn read_header<R>(reader: &mut R) -> DatReaderResult<LoggerHeader>
where
    R: Read,
{
    let identifier = read_str(reader, IDENTIFIER_BYTES)?;
    let encoding_flag = EncodingFlag::try_from(read_u8(reader)?)?;
    let start_date_time = read_date_time(reader)?;
    let raw_interval = read_u16(reader)?;
    let measurement_type = read_str(reader, MEASUREMENT_TYPE_BYTES)?;
    let units = read_str(reader, UNITS_BYTES)?;
    let calibration_max = read_f32(reader)?;
    let calibration_min = read_f32(reader)?;

    Ok(LoggerHeader {
        identifier,
        encoding_flag,
        start_date_time,
        interval_minutes: raw_interval / TENTHS_OF_SECOND_PER_MINUTE,
        measurement_type,
        units,
        calibration_min,
        calibration_max,
    })
}
