use std::path::Path;

use tracing_subscriber::EnvFilter;

use telemetry_logger::readers::{decode_files, LoggerSeries};
use telemetry_logger::writers::write_numeric_csv_file;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    let dest_dir_path = Path::new("resources/decoded");
    for (path, result) in decode_files(&paths) {
        // 読み込めなかったファイルは記録して、残りのファイルの処理を続ける
        let reader = match result {
            Ok(reader) => reader,
            Err(e) => {
                eprintln!("{}: {e}", path.display());
                continue;
            }
        };
        let header = reader.header();
        println!(
            "{} {} [{}] {:?} {}分間隔 {}件",
            header.identifier,
            header.measurement_type,
            header.units,
            header.encoding_flag,
            header.interval_minutes,
            reader.series().len(),
        );
        let LoggerSeries::Numeric(samples) = reader.series() else {
            continue;
        };
        let file_name = format!("{}.csv", header.identifier);
        // 出力先のディレクトリは書き込み時に作成される
        write_numeric_csv_file(dest_dir_path.join(file_name), samples)?;
    }

    Ok(())
}
