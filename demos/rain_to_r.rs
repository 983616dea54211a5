use std::path::Path;

use tracing_subscriber::EnvFilter;

use telemetry_logger::config::{Config, Placeholders};
use telemetry_logger::rainfall::reconstruct;
use telemetry_logger::readers::{DatReader, LoggerSeries};
use telemetry_logger::writers::write_rainfall_file;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = Path::new("resources/installation.toml");
    let config = if config_path.exists() {
        Config::load_from_path(config_path)?
    } else {
        Config::default()
    };
    let placeholders = Placeholders {
        logger_id: "RG01".to_string(),
        install_id: "1".to_string(),
        client_ref: "CLIENT".to_string(),
        site_id: "SITE1".to_string(),
        job_number: "J0001".to_string(),
    };

    let reader = DatReader::new(config.logger_data_path(&placeholders)?)?;
    let LoggerSeries::Tips(tips) = reader.series() else {
        anyhow::bail!("{}は転倒ます雨量計のファイルではありません。", reader.path().display());
    };
    let series = reconstruct(tips, config.rainfall.bucket_depth_mm)?;
    let (Some(first), Some(last)) = (series.first(), series.last()) else {
        println!("転倒イベントが記録されていません。");
        return Ok(());
    };
    let dest_file_path = config.rainfall_output_path(&placeholders)?;
    write_rainfall_file(
        &dest_file_path,
        &series,
        reader.identifier(),
        first.timestamp,
        last.timestamp,
    )?;
    println!("{}件の降雨強度を{}に出力しました。", series.len(), dest_file_path.display());

    Ok(())
}
