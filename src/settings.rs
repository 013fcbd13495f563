//! Persistent user settings.
//!
//! Settings live in a flat JSON object on disk, one key per option. Values
//! may have been written by hand or by older tools, so when we read them back
//! we coerce each value to the type of that key's default instead of
//! rejecting the whole file. See [`coerce_like`].

use std::sync::LazyLock;

use clap::ValueEnum;
use schemars::JsonSchema;
use serde_json::Map;

use crate::{async_utils::io::read_json_object, prelude::*};

/// Environment variable which overrides the settings file location.
pub const SETTINGS_PATH_ENV: &str = "OCR_BATCH_SETTINGS";

/// Languages offered when `tesseract --list-langs` is not available.
pub const FALLBACK_LANGUAGES: &[&str] =
    &["eng", "tur", "fra", "deu", "spa", "ita", "por", "rus"];

/// The kind of PDF the engine should write.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
pub enum OutputType {
    /// A standard PDF.
    #[default]
    #[serde(rename = "pdf")]
    #[value(name = "pdf")]
    Pdf,
    /// PDF/A, letting the engine pick the part.
    #[serde(rename = "pdfa")]
    #[value(name = "pdfa")]
    Pdfa,
    /// PDF/A-1b.
    #[serde(rename = "pdfa-1")]
    #[value(name = "pdfa-1")]
    Pdfa1,
    /// PDF/A-2b.
    #[serde(rename = "pdfa-2")]
    #[value(name = "pdfa-2")]
    Pdfa2,
    /// PDF/A-3b.
    #[serde(rename = "pdfa-3")]
    #[value(name = "pdfa-3")]
    Pdfa3,
}

impl OutputType {
    /// The name used in settings files.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputType::Pdf => "pdf",
            OutputType::Pdfa => "pdfa",
            OutputType::Pdfa1 => "pdfa-1",
            OutputType::Pdfa2 => "pdfa-2",
            OutputType::Pdfa3 => "pdfa-3",
        }
    }

    /// Is this one of the archival formats?
    pub fn is_archival(self) -> bool {
        self.as_str().starts_with("pdfa")
    }
}

/// Everything the user can configure between runs.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Tesseract language code(s), such as `eng` or `eng+deu`.
    pub ocr_language: String,
    /// Directory containing Tesseract language data. Empty means the
    /// Tesseract default.
    pub tesseract_data_dir: String,
    /// Tesseract page segmentation mode (0-13).
    pub tesseract_psm: u32,
    /// Tesseract OCR engine mode (0-3).
    pub tesseract_oem: u32,

    /// Skip pages which already contain text.
    pub skip_text: bool,
    /// Rasterize and OCR every page, even ones with text.
    pub force_ocr: bool,
    /// Replace an existing OCR layer.
    pub redo_ocr: bool,

    /// Automatically rotate pages based on detected text orientation.
    pub rotate_pages: bool,
    /// Deskew crooked pages.
    pub deskew: bool,
    /// Clean pages before OCR.
    pub clean: bool,
    /// Remove page backgrounds.
    pub remove_background: bool,

    /// DPI to assume for image inputs without resolution metadata.
    pub image_dpi: u32,
    /// JPEG quality used when optimizing (1-100).
    pub jpeg_quality: u32,
    /// PNG quality used when optimizing (1-100).
    pub png_quality: u32,

    /// The kind of PDF to write.
    pub output_type: OutputType,
    /// Optimization level (0-3).
    pub optimize: u32,
    /// Suffix added to the input's base name to build the output name.
    pub output_suffix: String,
    /// Where to write output files. Unset means [`default_output_dir`].
    pub output_dir: Option<PathBuf>,

    /// PDF metadata: title.
    pub pdf_title: String,
    /// PDF metadata: author.
    pub pdf_author: String,
    /// PDF metadata: subject.
    pub pdf_subject: String,
    /// PDF metadata: keywords.
    pub pdf_keywords: String,

    /// Number of worker threads the engine may use for a single file.
    pub jobs: usize,

    /// Extra engine parameters, separated by whitespace.
    pub tesseract_params: String,
    /// Keep the engine's temporary files for debugging.
    pub keep_temp_files: bool,
    /// Ask the engine for verbose output.
    pub verbose_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ocr_language: "eng".to_owned(),
            tesseract_data_dir: String::new(),
            tesseract_psm: 3,
            tesseract_oem: 3,
            skip_text: false,
            force_ocr: false,
            redo_ocr: false,
            rotate_pages: false,
            deskew: false,
            clean: false,
            remove_background: false,
            image_dpi: 300,
            jpeg_quality: 95,
            png_quality: 95,
            output_type: OutputType::Pdf,
            optimize: 1,
            output_suffix: "_ocr".to_owned(),
            output_dir: None,
            pdf_title: String::new(),
            pdf_author: String::new(),
            pdf_subject: String::new(),
            pdf_keywords: String::new(),
            jobs: num_cpus::get().clamp(1, 4),
            tesseract_params: String::new(),
            keep_temp_files: false,
            verbose_logging: false,
        }
    }
}

/// Our defaults, as a JSON object. Used to look up key names and the type
/// each key should have.
static DEFAULT_MAP: LazyLock<Map<String, Value>> = LazyLock::new(|| {
    match serde_json::to_value(Settings::default()) {
        Ok(Value::Object(map)) => map,
        _ => unreachable!("Settings always serializes to an object"),
    }
});

impl Settings {
    /// All recognized setting names.
    pub fn keys() -> impl Iterator<Item = &'static str> {
        DEFAULT_MAP.keys().map(|k| k.as_str())
    }

    /// Convert to a flat JSON object.
    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self).context("failed to serialize settings")? {
            Value::Object(map) => Ok(map),
            other => Err(anyhow!("settings serialized to non-object: {}", other)),
        }
    }

    /// Look up a single setting by name.
    pub fn get(&self, key: &str) -> Result<Value> {
        self.to_map()?
            .remove(key)
            .ok_or_else(|| anyhow!("unknown setting {:?}", key))
    }

    /// Set a single setting by name. The value is coerced to the type of the
    /// setting, and we fail if that isn't possible.
    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        let default = DEFAULT_MAP
            .get(key)
            .ok_or_else(|| anyhow!("unknown setting {:?}", key))?;
        let coerced = coerce_like(default, value).ok_or_else(|| {
            anyhow!("cannot use {} as a value for setting {:?}", value, key)
        })?;
        let mut map = self.to_map()?;
        map.insert(key.to_owned(), coerced);
        *self = serde_json::from_value(Value::Object(map))
            .with_context(|| format!("invalid value {} for setting {:?}", value, key))?;
        Ok(())
    }

    /// Build settings from a loosely-typed JSON object, as read from disk or
    /// imported from a file.
    ///
    /// Unknown keys are ignored, and values which can't be used fall back to
    /// the defaults. Returns the settings and the number of keys applied.
    pub fn from_map_lenient(map: &Map<String, Value>) -> (Self, usize) {
        let mut settings = Settings::default();
        let applied = settings.merge_lenient(map);
        (settings, applied)
    }

    /// Apply recognized keys from `map`, skipping anything unusable. Returns
    /// the number of keys applied.
    pub fn merge_lenient(&mut self, map: &Map<String, Value>) -> usize {
        let mut applied = 0;
        for (key, value) in map {
            if !DEFAULT_MAP.contains_key(key) {
                warn!(key = %key, "Ignoring unknown setting");
                continue;
            }
            match self.set(key, value) {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!(key = %key, "Using default for setting: {:#}", err);
                    if let Some(default) = DEFAULT_MAP.get(key) {
                        // Defaults always deserialize.
                        let _ = self.set(key, default);
                    }
                }
            }
        }
        applied
    }

    /// Range and enum checks. The worker never validates options, so this
    /// must be called at the edge.
    pub fn validate(&self) -> Result<()> {
        if self.ocr_language.trim().is_empty() {
            return Err(anyhow!("ocr_language must not be empty"));
        }
        check_range("tesseract_psm", self.tesseract_psm, 0, 13)?;
        check_range("tesseract_oem", self.tesseract_oem, 0, 3)?;
        check_range("jpeg_quality", self.jpeg_quality, 1, 100)?;
        check_range("png_quality", self.png_quality, 1, 100)?;
        check_range("optimize", self.optimize, 0, 3)?;
        if self.image_dpi == 0 {
            return Err(anyhow!("image_dpi must be at least 1"));
        }
        if self.jobs == 0 {
            return Err(anyhow!("jobs must be at least 1"));
        }
        let modes = [self.force_ocr, self.skip_text, self.redo_ocr];
        if modes.iter().filter(|&&m| m).count() > 1 {
            return Err(anyhow!(
                "only one of force_ocr, skip_text and redo_ocr may be enabled"
            ));
        }
        Ok(())
    }

    /// The output directory to use for a job.
    pub fn resolved_output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(default_output_dir)
    }

    /// Snapshot the options a job needs.
    pub fn ocr_options(&self) -> OcrOptions {
        OcrOptions {
            language: self.ocr_language.clone(),
            rotate_pages: self.rotate_pages,
            deskew: self.deskew,
            clean: self.clean,
            remove_background: self.remove_background,
            jobs: self.jobs,
            output_type: self.output_type,
            optimize: self.optimize,
            force_ocr: self.force_ocr,
            skip_text: self.skip_text,
            redo_ocr: self.redo_ocr,
            tesseract_psm: self.tesseract_psm,
            tesseract_oem: self.tesseract_oem,
            tesseract_params: self.tesseract_params.clone(),
            image_dpi: self.image_dpi,
            jpeg_quality: self.jpeg_quality,
            png_quality: self.png_quality,
            keep_temp_files: self.keep_temp_files,
            verbose_logging: self.verbose_logging,
            output_suffix: self.output_suffix.clone(),
            pdf_title: self.pdf_title.clone(),
            pdf_author: self.pdf_author.clone(),
            pdf_subject: self.pdf_subject.clone(),
            pdf_keywords: self.pdf_keywords.clone(),
        }
    }
}

fn check_range(name: &str, value: u32, min: u32, max: u32) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(anyhow!("{} must be between {} and {}, got {}", name, min, max, value))
    }
}

/// The option set for a single job. Captured once when the job starts and
/// never changed afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct OcrOptions {
    pub language: String,
    pub rotate_pages: bool,
    pub deskew: bool,
    pub clean: bool,
    pub remove_background: bool,
    pub jobs: usize,
    pub output_type: OutputType,
    pub optimize: u32,
    pub force_ocr: bool,
    pub skip_text: bool,
    pub redo_ocr: bool,
    pub tesseract_psm: u32,
    pub tesseract_oem: u32,
    pub tesseract_params: String,
    pub image_dpi: u32,
    pub jpeg_quality: u32,
    pub png_quality: u32,
    pub keep_temp_files: bool,
    pub verbose_logging: bool,
    pub output_suffix: String,
    pub pdf_title: String,
    pub pdf_author: String,
    pub pdf_subject: String,
    pub pdf_keywords: String,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Settings::default().ocr_options()
    }
}

/// Parse a boolean the way string-only settings backends store them.
pub fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Coerce `value` to the JSON type of `default`.
///
/// Returns `None` if the value can't be used for a setting of that type.
/// Booleans never fail: anything unrecognized is `false`.
pub fn coerce_like(default: &Value, value: &Value) -> Option<Value> {
    match default {
        Value::Bool(_) => Some(Value::Bool(match value {
            Value::Bool(b) => *b,
            Value::String(s) => parse_bool(s),
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => false,
        })),
        Value::Number(_) => match value {
            Value::Number(n) if n.is_u64() || n.is_i64() => Some(value.clone()),
            Value::Number(n) => n.as_f64().and_then(whole_number),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .map(Value::from)
                    .or_else(|| s.parse::<f64>().ok().and_then(whole_number))
            }
            _ => None,
        },
        Value::String(_) => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            Value::Null => Some(Value::String(String::new())),
            _ => None,
        },
        // Optional values, like `output_dir`.
        Value::Null => match value {
            Value::Null => Some(Value::Null),
            Value::String(s) if s.is_empty() => Some(Value::Null),
            Value::String(_) => Some(value.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// `n` as an integer value, if it has no fractional part.
fn whole_number(n: f64) -> Option<Value> {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= i64::MAX as f64 {
        Some(Value::from(n as i64))
    } else {
        None
    }
}

/// Where output files go unless the user says otherwise.
pub fn default_output_dir() -> PathBuf {
    dirs::desktop_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("OCR_Output")
}

/// Settings backed by a JSON file.
#[derive(Debug)]
pub struct SettingsStore {
    /// Where we persist settings.
    path: PathBuf,

    /// The current settings.
    settings: Settings,
}

impl SettingsStore {
    /// The default settings file, honoring [`SETTINGS_PATH_ENV`].
    pub fn default_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(SETTINGS_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("cannot find a configuration directory"))?;
        Ok(config_dir.join("ocr-batch").join("settings.json"))
    }

    /// Open the store at `path`. A missing file means all defaults.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn open(path: PathBuf) -> Result<Self> {
        let settings = if tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("cannot check for settings file {:?}", path))?
        {
            let map = read_json_object(&path).await?;
            Settings::from_map_lenient(&map).0
        } else {
            debug!("No settings file, using defaults");
            Settings::default()
        };
        Ok(Self { path, settings })
    }

    /// Where this store persists its settings.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Get a setting by name.
    pub fn get(&self, key: &str) -> Result<Value> {
        self.settings.get(key)
    }

    /// Set a setting by name. Call [`SettingsStore::save`] to persist.
    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        self.settings.set(key, value)?;
        debug!(key = %key, value = %value, "Setting changed");
        Ok(())
    }

    /// Replace all settings at once. Call [`SettingsStore::save`] to persist.
    pub fn replace(&mut self, settings: Settings) {
        self.settings = settings;
    }

    /// Reset everything to defaults. Call [`SettingsStore::save`] to persist.
    pub fn clear(&mut self) {
        self.settings = Settings::default();
        info!("All settings cleared");
    }

    /// Write the current settings to disk.
    pub async fn save(&self) -> Result<()> {
        write_settings(&self.path, &self.settings).await
    }

    /// Import settings from a flat JSON object. Returns the number of keys
    /// applied. Call [`SettingsStore::save`] to persist.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn import(&mut self, path: &Path) -> Result<usize> {
        let map = read_json_object(path).await?;
        let applied = self.settings.merge_lenient(&map);
        info!("Imported {} settings from {:?}", applied, path);
        Ok(applied)
    }

    /// Export every setting to a flat JSON object.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn export(&self, path: &Path) -> Result<()> {
        write_settings(path, &self.settings).await?;
        info!("Settings exported to {:?}", path);
        Ok(())
    }
}

/// Write settings as pretty JSON, creating parent directories as needed.
async fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create directory {:?}", parent))?;
    }
    let json = serde_json::to_string_pretty(&Value::Object(settings.to_map()?))
        .context("failed to serialize settings")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("cannot write settings to {:?}", path))
}
