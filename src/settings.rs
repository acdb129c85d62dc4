use std::path::Path;

use serde_json::Value;

use trawler_core::error::{Error, Result};
use trawler_core::settings::Settings;

/// Environment variable naming the settings file to load.
pub const SETTINGS_ENV: &str = "TRAWLER_SETTINGS";

/// Default project file name looked up in the working directory.
pub const PROJECT_FILE: &str = "trawler.toml";

/// Load a settings file (TOML or JSON by extension) over the defaults.
///
/// Settings-file keys are upper snake case, matching the documented
/// contract; a `[spiders]` table may define config-driven spiders and is
/// kept verbatim under the `SPIDERS` key.
pub fn load_settings_file(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;

    let parsed: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => {
            let table: toml::Value = contents
                .parse()
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            toml_to_json(table)
        }
        Some("json") => serde_json::from_str(&contents)?,
        other => {
            return Err(Error::Config(format!(
                "unsupported settings format '{}' for {}",
                other.unwrap_or(""),
                path.display()
            )))
        }
    };

    let Value::Object(map) = parsed else {
        return Err(Error::Config(format!(
            "{}: settings file must be a table of KEY = value entries",
            path.display()
        )));
    };

    let mut settings = Settings::defaults();
    for (key, value) in map {
        settings.set(key.to_ascii_uppercase(), value);
    }
    Ok(settings)
}

/// Resolve the effective settings: defaults, then the project file (from
/// `TRAWLER_SETTINGS`, an explicit path, or `trawler.toml` in the working
/// directory), then environment overrides.
pub fn resolve_settings(explicit: Option<&str>) -> Result<Settings> {
    let path = explicit
        .map(String::from)
        .or_else(|| std::env::var(SETTINGS_ENV).ok())
        .or_else(|| {
            Path::new(PROJECT_FILE)
                .exists()
                .then(|| PROJECT_FILE.to_string())
        });

    let mut settings = match path {
        Some(path) => load_settings_file(&path)?,
        None => Settings::defaults(),
    };
    settings.apply_env_overrides();
    Ok(settings)
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => Value::from(f),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn toml_settings_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "trawler.toml",
            r#"
CONCURRENT_REQUESTS = 4
DOWNLOAD_DELAY = 0.5
RETRY_HTTP_CODES = [500, 503]
"#,
        );

        let settings = load_settings_file(&path).unwrap();
        assert_eq!(settings.get_i64("CONCURRENT_REQUESTS"), 4);
        assert_eq!(settings.get_f64("DOWNLOAD_DELAY"), 0.5);
        assert_eq!(settings.get_u16_list("RETRY_HTTP_CODES"), vec![500, 503]);
        // Untouched defaults remain
        assert_eq!(settings.get_i64("RETRY_TIMES"), 2);
    }

    #[test]
    fn lowercase_keys_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "s.toml", "download_delay = 1.5\n");

        let settings = load_settings_file(&path).unwrap();
        assert_eq!(settings.get_f64("DOWNLOAD_DELAY"), 1.5);
    }

    #[test]
    fn json_settings_are_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "s.json", r#"{"RETRY_TIMES": 9}"#);

        let settings = load_settings_file(&path).unwrap();
        assert_eq!(settings.get_i64("RETRY_TIMES"), 9);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "s.yaml", "A: 1\n");
        assert!(load_settings_file(&path).is_err());
    }

    #[test]
    fn spiders_table_survives_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "trawler.toml",
            r#"
[SPIDERS.quotes]
start_urls = ["https://quotes.example.com/"]
"#,
        );

        let settings = load_settings_file(&path).unwrap();
        let spiders = settings.get("SPIDERS").unwrap();
        assert!(spiders.get("quotes").is_some());
    }
}
