//! OCR engine interface.
//!
//! The real recognition work happens in an external engine. We only decide
//! which parameters to hand it, and how to interpret its failures.

use thiserror::Error;

use crate::{prelude::*, settings::OcrOptions};

pub mod deps;
pub mod ocrmypdf;

/// Optimization level the engine uses unless the options say otherwise.
pub const DEFAULT_OPTIMIZE: u32 = 1;

/// Ways a single engine call can fail.
///
/// These are the failures the worker knows how to explain to a user. Anything
/// else ends up in [`EngineError::Other`] with the engine's own text.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The input already has a text layer.
    #[error("page already has text")]
    PriorOcrFound,
    /// The input is encrypted.
    #[error("input PDF is encrypted")]
    Encrypted,
    /// The input is missing or is not a usable PDF.
    #[error("input file is missing or invalid")]
    InputFile,
    /// The output path can't be written.
    #[error("cannot write output file")]
    OutputFileAccess,
    /// The input embeds images the engine can't handle.
    #[error("input contains an unsupported image format")]
    UnsupportedImageFormat,
    /// Anything else. Holds the engine's own description.
    #[error("{0}")]
    Other(String),
}

/// Interface to an OCR engine.
///
/// Calls are opaque, potentially long-running and cannot be interrupted once
/// started.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Make sure the engine can be used at all. Returns a version string.
    async fn check_available(&self) -> Result<String>;

    /// OCR `input`, writing a searchable PDF to `output`.
    async fn ocr(
        &self,
        input: &Path,
        output: &Path,
        params: &EngineParams,
    ) -> Result<(), EngineError>;
}

/// Parameters for a single engine call.
///
/// Built from [`OcrOptions`] by [`EngineParams::from_options`]. Fields are
/// `None` or `false` when the engine should use its own default.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineParams {
    pub language: Option<String>,
    pub rotate_pages: bool,
    pub deskew: bool,
    pub clean: bool,
    pub remove_background: bool,
    /// Only set when more than one job was requested.
    pub jobs: Option<usize>,
    /// Whether to write an archival PDF. All PDF/A variants collapse into
    /// this one flag.
    pub archival: bool,
    pub optimize: u32,
    pub force_ocr: bool,
    pub skip_text: bool,
    pub redo_ocr: bool,
    pub tesseract_psm: Option<u32>,
    pub tesseract_oem: Option<u32>,
    pub image_dpi: Option<u32>,
    pub jpeg_quality: Option<u32>,
    pub png_quality: Option<u32>,
    pub keep_temp_files: bool,
    pub verbose: bool,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
    /// Tesseract config variables, from `-c name=value` parameters. Written
    /// to a config file, never passed to the engine as arguments.
    pub tesseract_config: Vec<(String, String)>,
    /// The engine's console progress bar. Always off, because its output
    /// goes nowhere useful.
    pub progress_bar: bool,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            language: None,
            rotate_pages: false,
            deskew: false,
            clean: false,
            remove_background: false,
            jobs: None,
            archival: false,
            optimize: DEFAULT_OPTIMIZE,
            force_ocr: false,
            skip_text: false,
            redo_ocr: false,
            tesseract_psm: None,
            tesseract_oem: None,
            image_dpi: None,
            jpeg_quality: None,
            png_quality: None,
            keep_temp_files: false,
            verbose: false,
            title: None,
            author: None,
            subject: None,
            keywords: None,
            tesseract_config: vec![],
            progress_bar: false,
        }
    }
}

/// `Some(s)` if `s` has any non-whitespace content.
fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

/// `Some(n)` if `n` is non-zero.
fn non_zero(n: u32) -> Option<u32> {
    (n != 0).then_some(n)
}

impl EngineParams {
    /// Translate a job's options into engine parameters.
    ///
    /// Only options which are actually set are forwarded.
    pub fn from_options(options: &OcrOptions) -> Self {
        Self {
            language: non_empty(&options.language),
            rotate_pages: options.rotate_pages,
            deskew: options.deskew,
            clean: options.clean,
            remove_background: options.remove_background,
            jobs: (options.jobs > 1).then_some(options.jobs),
            archival: options.output_type.is_archival(),
            optimize: options.optimize,
            force_ocr: options.force_ocr,
            skip_text: options.skip_text,
            redo_ocr: options.redo_ocr,
            // 0 is a real mode for both of these.
            tesseract_psm: Some(options.tesseract_psm),
            tesseract_oem: Some(options.tesseract_oem),
            image_dpi: non_zero(options.image_dpi),
            jpeg_quality: non_zero(options.jpeg_quality),
            png_quality: non_zero(options.png_quality),
            keep_temp_files: options.keep_temp_files,
            verbose: options.verbose_logging,
            title: non_empty(&options.pdf_title),
            author: non_empty(&options.pdf_author),
            subject: non_empty(&options.pdf_subject),
            keywords: non_empty(&options.pdf_keywords),
            tesseract_config: parse_tesseract_params(&options.tesseract_params),
            progress_bar: false,
        }
    }

    /// The contents of a Tesseract config file holding
    /// [`EngineParams::tesseract_config`], if there are any variables.
    pub fn tesseract_config_text(&self) -> Option<String> {
        if self.tesseract_config.is_empty() {
            return None;
        }
        Some(
            self.tesseract_config
                .iter()
                .map(|(name, value)| format!("{} {}\n", name, value))
                .collect(),
        )
    }

    /// Render as `ocrmypdf` command-line arguments, not including the input
    /// and output paths. `tesseract_config` is the file written from
    /// [`EngineParams::tesseract_config_text`].
    pub fn to_args(&self, tesseract_config: Option<&Path>) -> Vec<String> {
        let mut args = vec![];
        let mut push_value = |flag: &str, value: String| {
            args.push(flag.to_owned());
            args.push(value);
        };
        if let Some(language) = &self.language {
            push_value("--language", language.clone());
        }
        if let Some(jobs) = self.jobs {
            push_value("--jobs", jobs.to_string());
        }
        if self.archival {
            push_value("--output-type", "pdfa".to_owned());
        }
        push_value("--optimize", self.optimize.to_string());
        if let Some(psm) = self.tesseract_psm {
            push_value("--tesseract-pagesegmode", psm.to_string());
        }
        if let Some(oem) = self.tesseract_oem {
            push_value("--tesseract-oem", oem.to_string());
        }
        if let Some(dpi) = self.image_dpi {
            push_value("--image-dpi", dpi.to_string());
        }
        if let Some(quality) = self.jpeg_quality {
            push_value("--jpeg-quality", quality.to_string());
        }
        if let Some(quality) = self.png_quality {
            push_value("--png-quality", quality.to_string());
        }
        if let Some(title) = &self.title {
            push_value("--title", title.clone());
        }
        if let Some(author) = &self.author {
            push_value("--author", author.clone());
        }
        if let Some(subject) = &self.subject {
            push_value("--subject", subject.clone());
        }
        if let Some(keywords) = &self.keywords {
            push_value("--keywords", keywords.clone());
        }
        if self.verbose {
            push_value("--verbose", "1".to_owned());
        }
        if let Some(config) = tesseract_config {
            push_value("--tesseract-config", config.display().to_string());
        }

        let flags = [
            (self.rotate_pages, "--rotate-pages"),
            (self.deskew, "--deskew"),
            (self.clean, "--clean"),
            (self.remove_background, "--remove-background"),
            (self.force_ocr, "--force-ocr"),
            (self.skip_text, "--skip-text"),
            (self.redo_ocr, "--redo-ocr"),
            (self.keep_temp_files, "--keep-temporary-files"),
            (!self.progress_bar, "--no-progress-bar"),
        ];
        args.extend(
            flags
                .into_iter()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, flag)| flag.to_owned()),
        );
        args
    }
}

/// Parse Tesseract command-line parameters into config variables.
///
/// We understand `-c name=value`, `-cname=value` and bare `name=value`.
/// Anything else is logged and dropped, because we never pass user text
/// through to the engine's own command line.
pub fn parse_tesseract_params(params: &str) -> Vec<(String, String)> {
    let mut vars = vec![];
    let mut tokens = params.split_whitespace();
    while let Some(token) = tokens.next() {
        let assignment = match token {
            "-c" => match tokens.next() {
                Some(next) => next,
                None => {
                    warn!("Ignoring Tesseract parameter `-c` with no value");
                    break;
                }
            },
            _ => token.strip_prefix("-c").unwrap_or(token),
        };
        match assignment.split_once('=') {
            Some((name, value))
                if !name.is_empty() && !name.starts_with('-') && !value.is_empty() =>
            {
                vars.push((name.to_owned(), value.to_owned()));
            }
            _ => warn!(
                parameter = %assignment,
                "Ignoring Tesseract parameter; only `-c name=value` is supported"
            ),
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::OutputType;

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|a| a == flag)
    }

    #[test]
    fn jobs_only_forwarded_when_more_than_one() {
        let mut options = OcrOptions {
            jobs: 1,
            ..OcrOptions::default()
        };
        let params = EngineParams::from_options(&options);
        assert_eq!(params.jobs, None);
        assert!(!has_flag(&params.to_args(None), "--jobs"));

        options.jobs = 4;
        let params = EngineParams::from_options(&options);
        assert_eq!(params.jobs, Some(4));
        let args = params.to_args(None);
        let pos = args.iter().position(|a| a == "--jobs").unwrap();
        assert_eq!(args[pos + 1], "4");
    }

    #[test]
    fn pdfa_variants_collapse_to_one_flag() {
        for output_type in [OutputType::Pdfa, OutputType::Pdfa1, OutputType::Pdfa3] {
            let options = OcrOptions {
                output_type,
                ..OcrOptions::default()
            };
            let args = EngineParams::from_options(&options).to_args(None);
            let pos = args.iter().position(|a| a == "--output-type").unwrap();
            assert_eq!(args[pos + 1], "pdfa");
        }
        let args = EngineParams::from_options(&OcrOptions::default()).to_args(None);
        assert!(!has_flag(&args, "--output-type"));
    }

    #[test]
    fn defaults_apply_unless_overridden() {
        let params = EngineParams::from_options(&OcrOptions::default());
        assert_eq!(params.optimize, DEFAULT_OPTIMIZE);
        assert!(!params.force_ocr);
        assert!(!params.skip_text);
        assert!(!params.progress_bar);
        let args = params.to_args(None);
        assert!(has_flag(&args, "--no-progress-bar"));
        assert!(!has_flag(&args, "--force-ocr"));
        assert!(!has_flag(&args, "--skip-text"));

        let options = OcrOptions {
            optimize: 3,
            force_ocr: true,
            ..OcrOptions::default()
        };
        let args = EngineParams::from_options(&options).to_args(None);
        let pos = args.iter().position(|a| a == "--optimize").unwrap();
        assert_eq!(args[pos + 1], "3");
        assert!(has_flag(&args, "--force-ocr"));
    }

    #[test]
    fn only_set_options_are_forwarded() {
        let options = OcrOptions {
            language: " ".to_owned(),
            deskew: true,
            image_dpi: 0,
            pdf_title: "Minutes".to_owned(),
            tesseract_params: "-c  preserve_interword_spaces=1".to_owned(),
            ..OcrOptions::default()
        };
        let params = EngineParams::from_options(&options);
        assert_eq!(params.language, None);
        assert_eq!(params.image_dpi, None);
        assert_eq!(params.title.as_deref(), Some("Minutes"));
        assert_eq!(params.author, None);

        assert_eq!(
            params.tesseract_config,
            vec![("preserve_interword_spaces".to_owned(), "1".to_owned())]
        );

        let args = params.to_args(Some(Path::new("/tmp/tess.cfg")));
        assert!(has_flag(&args, "--deskew"));
        assert!(!has_flag(&args, "--clean"));
        assert!(!has_flag(&args, "--language"));
        assert!(!has_flag(&args, "--author"));
        let pos = args.iter().position(|a| a == "--tesseract-config").unwrap();
        assert_eq!(args[pos + 1], "/tmp/tess.cfg");
        assert!(!has_flag(&args, "-c"));
        assert!(!has_flag(&args, "preserve_interword_spaces=1"));
    }

    #[test]
    fn tesseract_params_become_config_variables() {
        let vars = parse_tesseract_params(
            "-c preserve_interword_spaces=1 -ctessedit_do_invert=0 textord_heavy_nr=1 --psm 6 -c",
        );
        assert_eq!(
            vars,
            vec![
                ("preserve_interword_spaces".to_owned(), "1".to_owned()),
                ("tessedit_do_invert".to_owned(), "0".to_owned()),
                ("textord_heavy_nr".to_owned(), "1".to_owned()),
            ]
        );

        let params = EngineParams {
            tesseract_config: vars,
            ..EngineParams::default()
        };
        assert_eq!(
            params.tesseract_config_text().unwrap(),
            "preserve_interword_spaces 1\ntessedit_do_invert 0\ntextord_heavy_nr 1\n"
        );
        assert_eq!(EngineParams::default().tesseract_config_text(), None);
        assert!(!has_flag(&EngineParams::default().to_args(None), "--tesseract-config"));
    }
}
