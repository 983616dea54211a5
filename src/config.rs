//! 設置箇所ごとの設定
//!
//! 転倒1回あたりの雨量と、入出力ファイルのパスのテンプレートを`toml`ファイルから読み込む。
//! テンプレートには`{logger_id}`のようなプレースホルダを記述でき、
//! [`Placeholders`]の値で置き換えてパスを決定する。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

/// 転倒1回あたりの雨量の既定値（mm）
pub const DEFAULT_BUCKET_DEPTH_MM: f64 = 0.2;

/// 設定
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// 雨量計の設定
    #[serde(default)]
    pub rainfall: RainfallConfig,

    /// ファイル・パスのテンプレート
    #[serde(default)]
    pub paths: PathTemplates,
}

/// 雨量計の設定
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RainfallConfig {
    /// 転倒1回あたりの雨量（mm）
    pub bucket_depth_mm: f64,
}

impl Default for RainfallConfig {
    fn default() -> Self {
        Self {
            bucket_depth_mm: DEFAULT_BUCKET_DEPTH_MM,
        }
    }
}

/// ファイル・パスのテンプレート
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PathTemplates {
    /// ロガーの`.dat`ファイル
    pub logger_data: String,

    /// ポンプ運転状態のCSVファイル
    pub pump_data: String,

    /// `.r`ファイルの出力先
    pub rainfall_output: String,
}

impl Default for PathTemplates {
    fn default() -> Self {
        Self {
            logger_data: "{job_number}/{site_id}/{logger_id}.dat".to_string(),
            pump_data: "{job_number}/{site_id}/{logger_id}.csv".to_string(),
            rainfall_output: "{job_number}/{client_ref}_{install_id}.r".to_string(),
        }
    }
}

/// プレースホルダに代入する値
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placeholders {
    pub logger_id: String,
    pub install_id: String,
    pub client_ref: String,
    pub site_id: String,
    pub job_number: String,
}

impl Placeholders {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "logger_id" => Some(self.logger_id.as_str()),
            "install_id" => Some(self.install_id.as_str()),
            "client_ref" => Some(self.client_ref.as_str()),
            "site_id" => Some(self.site_id.as_str()),
            "job_number" => Some(self.job_number.as_str()),
            _ => None,
        }
    }
}

/// Configエラー型
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// ファイル読み込みエラー
    #[error("設定ファイルを読み込めませんでした。{0}")]
    Read(String),

    /// 設定ファイルの書式エラー
    #[error("設定ファイルの書式が不正です。{0}")]
    Parse(String),

    /// 未知のプレースホルダ
    #[error("未知のプレースホルダです。`{0}`")]
    UnknownPlaceholder(String),
}

/// Config結果型
pub type ConfigResult<T> = Result<T, ConfigError>;

impl Config {
    /// 設定ファイルを読み込む。
    pub fn load_from_path<P>(path: P) -> ConfigResult<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml(&contents)?;
        info!(path = %path.display(), "設定ファイルを読み込みました");

        Ok(config)
    }

    /// `toml`形式の文字列から設定を構築する。
    pub fn from_toml(contents: &str) -> ConfigResult<Self> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(format!("{e}")))
    }

    /// `.dat`ファイルのパスを返す。
    pub fn logger_data_path(&self, placeholders: &Placeholders) -> ConfigResult<PathBuf> {
        resolve_template(&self.paths.logger_data, placeholders).map(PathBuf::from)
    }

    /// ポンプ運転状態のCSVファイルのパスを返す。
    pub fn pump_data_path(&self, placeholders: &Placeholders) -> ConfigResult<PathBuf> {
        resolve_template(&self.paths.pump_data, placeholders).map(PathBuf::from)
    }

    /// `.r`ファイルの出力先のパスを返す。
    pub fn rainfall_output_path(&self, placeholders: &Placeholders) -> ConfigResult<PathBuf> {
        resolve_template(&self.paths.rainfall_output, placeholders).map(PathBuf::from)
    }
}

/// テンプレートのプレースホルダを置き換える。
///
/// 閉じていない`{`や未知のプレースホルダはエラーとする。
pub fn resolve_template(template: &str, placeholders: &Placeholders) -> ConfigResult<String> {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        resolved.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| ConfigError::UnknownPlaceholder(rest[open..].to_string()))?;
        let name = &after[..close];
        let value = placeholders
            .lookup(name)
            .ok_or_else(|| ConfigError::UnknownPlaceholder(name.to_string()))?;
        resolved.push_str(value);
        rest = &after[close + 1..];
    }
    resolved.push_str(rest);

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholders() -> Placeholders {
        Placeholders {
            logger_id: "L042".to_string(),
            install_id: "RG1".to_string(),
            client_ref: "ACME".to_string(),
            site_id: "S7".to_string(),
            job_number: "J1001".to_string(),
        }
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.rainfall.bucket_depth_mm, 0.2);
        assert_eq!(
            config.logger_data_path(&placeholders()).unwrap(),
            PathBuf::from("J1001/S7/L042.dat")
        );
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config = Config::from_toml("[rainfall]\nbucket_depth_mm = 0.5\n").unwrap();
        assert_eq!(config.rainfall.bucket_depth_mm, 0.5);
        assert_eq!(config.paths, PathTemplates::default());
    }

    #[test]
    fn config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert_eq!(Config::from_toml(&toml_str).unwrap(), config);
    }

    #[test]
    fn resolves_every_placeholder() {
        let resolved = resolve_template(
            "{job_number}-{client_ref}/{site_id}/{install_id}_{logger_id}.r",
            &placeholders(),
        )
        .unwrap();
        assert_eq!(resolved, "J1001-ACME/S7/RG1_L042.r");
    }

    #[test]
    fn unknown_or_unterminated_placeholder_is_an_error() {
        assert!(matches!(
            resolve_template("{project}/x.dat", &placeholders()),
            Err(ConfigError::UnknownPlaceholder(name)) if name == "project"
        ));
        assert!(matches!(
            resolve_template("data/{site_id", &placeholders()),
            Err(ConfigError::UnknownPlaceholder(_))
        ));
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        assert!(matches!(
            Config::from_toml("[rainfall]\nbucket_depth_mm = \"deep\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
