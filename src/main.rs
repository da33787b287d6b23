mod anpr;
mod api;
mod config;
mod detector;
mod error;
mod fetch;
mod locator;
mod ocr;
mod pipeline;
#[cfg(test)]
mod test_support;
mod types;

use clap::Parser;
use config::{Command, Config, LocatorKind};
use env_logger::Env;
use log::{error, info};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[macro_use]
extern crate failure;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let config = Config::parse();
    info!("Starting plate-reader");

    if let Err(e) = run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
    info!("Exiting main");
}

async fn run(config: Config) -> Result<(), failure::Error> {
    let pipeline = Arc::new(build_pipeline(&config)?);
    match config.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => api::run(config.bind, config.profile, pipeline).await,
        Command::Extract { url } => {
            let url = match url {
                Some(url) => url,
                None => prompt_for_url().await?,
            };
            let text = pipeline.process(&url).await.map_err(failure::Error::from)?;
            println!("License Plate Text: {}", text);
            Ok(())
        }
    }
}

fn build_pipeline(config: &Config) -> Result<pipeline::Pipeline, failure::Error> {
    let temp_dir = config.temp_dir();
    let locator: Arc<dyn locator::PlateLocator> = match config.locator {
        LocatorKind::Detector => {
            let detector = detector::OwlDetector::new(
                config.owl_model.clone(),
                config.owl_tokenizer.clone(),
                config.detection_threshold,
            )?;
            info!("Using local detector {}", config.owl_model.display());
            Arc::new(locator::DetectorLocator::new(Arc::new(detector)))
        }
        LocatorKind::Anpr => {
            let settings = config.anpr()?;
            info!("Using recognition API at {}", settings.endpoint);
            Arc::new(anpr::AnprLocator::new(settings.endpoint, settings.api_key))
        }
    };
    let ocr = Arc::new(ocr::TesseractExtractor::new(
        &config.tesseract_lang,
        config.tesseract_psm,
        config.tesseract_oem,
        temp_dir.clone(),
    ));
    Ok(pipeline::Pipeline::new(fetch::ImageFetcher::new(temp_dir)?, locator, ocr))
}

async fn prompt_for_url() -> Result<String, failure::Error> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Enter the image URL: ").await?;
    stdout.flush().await?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    let url = line.trim().to_string();
    if url.is_empty() {
        return Err(format_err!("No image URL given"));
    }
    Ok(url)
}
