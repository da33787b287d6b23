use crate::api::ApiProfile;
use crate::detector::DEFAULT_THRESHOLD;
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "plate-reader")]
#[command(about = "Reads licence plate text from images on the web", long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address the HTTP service listens on
    #[arg(long, env = "PLATE_BIND", default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// How plates are located and read
    #[arg(long, env = "PLATE_LOCATOR", value_enum, default_value = "detector")]
    pub locator: LocatorKind,

    /// Route and field names of the JSON endpoint
    #[arg(long, env = "PLATE_API_PROFILE", value_enum, default_value = "standard")]
    pub profile: ApiProfile,

    /// Where downloaded images and OCR regions are written (defaults to the system temp dir)
    #[arg(long, env = "PLATE_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long, env = "OWL_MODEL_PATH", default_value = "models/owlv2/model.onnx")]
    pub owl_model: PathBuf,

    #[arg(long, env = "OWL_TOKENIZER_PATH", default_value = "models/owlv2/tokenizer.json")]
    pub owl_tokenizer: PathBuf,

    #[arg(long, env = "DETECTION_THRESHOLD", default_value_t = DEFAULT_THRESHOLD)]
    pub detection_threshold: f32,

    #[arg(long, env = "TESSERACT_LANG", default_value = "eng")]
    pub tesseract_lang: String,

    /// Tesseract page segmentation mode
    #[arg(long, env = "TESSERACT_PSM", default_value_t = 3)]
    pub tesseract_psm: i32,

    /// Tesseract OCR engine mode
    #[arg(long, env = "TESSERACT_OEM", default_value_t = 3)]
    pub tesseract_oem: i32,

    /// Recognition API endpoint, required with `--locator anpr`
    #[arg(long, env = "ANPR_ENDPOINT")]
    pub anpr_endpoint: Option<String>,

    /// Recognition API key, required with `--locator anpr`
    #[arg(long, env = "ANPR_API_KEY", hide_env_values = true)]
    pub anpr_api_key: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Extract the plate from one image URL and print it
    Extract {
        /// Image URL; read from stdin when omitted
        url: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorKind {
    /// Local zero-shot detector followed by OCR
    Detector,
    /// Remote recognition API
    Anpr,
}

/// Settings for the remote recognition API, checked at startup.
#[derive(Debug, Clone)]
pub struct AnprSettings {
    pub endpoint: Url,
    pub api_key: String,
}

impl Config {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn anpr(&self) -> Result<AnprSettings, failure::Error> {
        let api_key = self
            .anpr_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| format_err!("ANPR_API_KEY must be set to use the anpr locator"))?;
        let endpoint = self
            .anpr_endpoint
            .as_deref()
            .ok_or_else(|| format_err!("ANPR_ENDPOINT must be set to use the anpr locator"))?;
        let endpoint = Url::parse(endpoint)
            .map_err(|e| format_err!("Invalid ANPR_ENDPOINT {}: {}", endpoint, e))?;
        Ok(AnprSettings { endpoint, api_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("plate-reader").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_serve_standard_profile_with_detector() {
        let config = parse(&[]);
        assert_eq!(config.command, None);
        assert_eq!(config.locator, LocatorKind::Detector);
        assert_eq!(config.profile, ApiProfile::Standard);
        assert_eq!(config.bind.port(), 8000);
        assert_eq!((config.tesseract_psm, config.tesseract_oem), (3, 3));
    }

    #[test]
    fn anpr_requires_key() {
        let config = parse(&[
            "--locator",
            "anpr",
            "--anpr-endpoint",
            "https://anpr.test/readnumberplate",
        ]);
        let err = config.anpr().unwrap_err();
        assert!(err.to_string().contains("ANPR_API_KEY"));
    }

    #[test]
    fn anpr_rejects_bad_endpoint() {
        let config = parse(&["--anpr-endpoint", "not a url", "--anpr-api-key", "k"]);
        assert!(config.anpr().is_err());
    }

    #[test]
    fn anpr_settings_parse() {
        let config = parse(&[
            "--locator",
            "anpr",
            "--profile",
            "express",
            "--anpr-endpoint",
            "https://anpr.test/readnumberplate",
            "--anpr-api-key",
            "k",
        ]);
        let anpr = config.anpr().unwrap();
        assert_eq!(anpr.endpoint.path(), "/readnumberplate");
        assert_eq!(anpr.api_key, "k");
        assert_eq!(config.profile, ApiProfile::Express);
    }

    #[test]
    fn tesseract_engine_mode_is_configurable() {
        let config = parse(&["--tesseract-psm", "7", "--tesseract-oem", "1"]);
        assert_eq!(config.tesseract_psm, 7);
        assert_eq!(config.tesseract_oem, 1);
    }

    #[test]
    fn extract_takes_optional_url() {
        let config = parse(&["extract", "http://example.com/car.jpg"]);
        assert_eq!(
            config.command,
            Some(Command::Extract {
                url: Some("http://example.com/car.jpg".to_string())
            })
        );
        assert_eq!(parse(&["extract"]).command, Some(Command::Extract { url: None }));
    }
}
