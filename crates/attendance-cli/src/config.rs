use anyhow::{bail, Context, Result};
use attendance_core::liveness::{BlinkConfig, DEFAULT_EAR_THRESHOLD};
use attendance_core::matcher::DEFAULT_SIMILARITY_THRESHOLD;
use attendance_core::recognizer::ARCFACE_EMBEDDING_DIM;
use attendance_core::{EarDistance, MatchPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Runtime configuration.
///
/// Built-in defaults, then an optional TOML file (`--config` or
/// `ATTENDANCE_CONFIG`), then `ATTENDANCE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity a probe must exceed to match.
    pub similarity_threshold: f32,
    pub match_policy: MatchPolicy,
    /// Eye-aspect-ratio below which an eye counts as closed.
    pub ear_threshold: f32,
    pub ear_distance: EarDistance,
    /// Embedding length the store accepts; must equal the recognizer's.
    pub embedding_dim: usize,
    /// Maximum pooled SQLite connections.
    pub pool_size: u32,
}

/// On-disk layout; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    match_policy: Option<MatchPolicy>,
    ear_threshold: Option<f32>,
    ear_distance: Option<EarDistance>,
    embedding_dim: Option<usize>,
    pool_size: Option<u32>,
}

impl Config {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_from(explicit, |key| std::env::var(key).ok())
    }

    pub(crate) fn load_from<F>(explicit: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::defaults(&data_dir(&env));

        let file = explicit
            .map(Path::to_path_buf)
            .or_else(|| env("ATTENDANCE_CONFIG").map(PathBuf::from));
        if let Some(path) = file {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let parsed: FileConfig = toml::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            config.merge(parsed);
            tracing::debug!(path = %path.display(), "config file applied");
        }

        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn defaults(data_dir: &Path) -> Self {
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("attendance.db"),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            match_policy: MatchPolicy::default(),
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            ear_distance: EarDistance::default(),
            embedding_dim: ARCFACE_EMBEDDING_DIM,
            pool_size: 4,
        }
    }

    fn merge(&mut self, file: FileConfig) {
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.similarity_threshold {
            self.similarity_threshold = v;
        }
        if let Some(v) = file.match_policy {
            self.match_policy = v;
        }
        if let Some(v) = file.ear_threshold {
            self.ear_threshold = v;
        }
        if let Some(v) = file.ear_distance {
            self.ear_distance = v;
        }
        if let Some(v) = file.embedding_dim {
            self.embedding_dim = v;
        }
        if let Some(v) = file.pool_size {
            self.pool_size = v;
        }
    }

    fn apply_env<F>(&mut self, env: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("ATTENDANCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ATTENDANCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        env_parse(env, "ATTENDANCE_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        env_parse(env, "ATTENDANCE_MATCH_POLICY", &mut self.match_policy);
        env_parse(env, "ATTENDANCE_EAR_THRESHOLD", &mut self.ear_threshold);
        env_parse(env, "ATTENDANCE_EAR_DISTANCE", &mut self.ear_distance);
        env_parse(env, "ATTENDANCE_EMBEDDING_DIM", &mut self.embedding_dim);
        env_parse(env, "ATTENDANCE_POOL_SIZE", &mut self.pool_size);
    }

    fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must lie in [-1, 1], got {}",
                self.similarity_threshold
            );
        }
        if self.ear_threshold.is_nan() || self.ear_threshold <= 0.0 {
            bail!("ear_threshold must be positive, got {}", self.ear_threshold);
        }
        if self.embedding_dim == 0 {
            bail!("embedding_dim must be positive");
        }
        if self.pool_size == 0 {
            bail!("pool_size must be positive");
        }
        Ok(())
    }

    pub fn blink(&self) -> BlinkConfig {
        BlinkConfig {
            ear_threshold: self.ear_threshold,
            distance: self.ear_distance,
        }
    }
}

/// `$XDG_DATA_HOME/attendance`, falling back to `~/.local/share/attendance`.
fn data_dir<F>(env: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attendance")
}

/// Override `slot` from `key` when set; unparsable values are logged and ignored.
fn env_parse<F, T>(env: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = env(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_under_xdg_data_home() {
        let config = Config::load_from(None, env_of(&[("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/data/attendance/models"));
        assert_eq!(config.db_path, PathBuf::from("/data/attendance/attendance.db"));
        assert_eq!(config.similarity_threshold, 0.5);
        assert_eq!(config.match_policy, MatchPolicy::First);
        assert_eq!(config.ear_threshold, 0.25);
        assert_eq!(config.ear_distance, EarDistance::Horizontal);
        assert_eq!(config.embedding_dim, 512);
        assert_eq!(config.pool_size, 4);
    }

    #[test]
    fn test_defaults_fall_back_to_home() {
        let config = Config::load_from(None, env_of(&[("HOME", "/home/ana")])).unwrap();
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/ana/.local/share/attendance/attendance.db")
        );
    }

    #[test]
    fn test_file_then_env_layering() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "similarity_threshold = 0.6\nmatch_policy = \"best\"\near_distance = \"euclidean\"\npool_size = 2"
        )
        .unwrap();

        let env = env_of(&[
            ("XDG_DATA_HOME", "/data"),
            ("ATTENDANCE_SIMILARITY_THRESHOLD", "0.7"),
            ("ATTENDANCE_DB_PATH", "/var/lib/attendance.db"),
        ]);
        let config = Config::load_from(Some(file.path()), env).unwrap();

        assert_eq!(config.similarity_threshold, 0.7);
        assert_eq!(config.match_policy, MatchPolicy::Best);
        assert_eq!(config.ear_distance, EarDistance::Euclidean);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/attendance.db"));
        assert_eq!(config.model_dir, PathBuf::from("/data/attendance/models"));
    }

    #[test]
    fn test_config_file_from_env_variable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ear_threshold = 0.2").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let config = Config::load_from(None, env_of(&[("ATTENDANCE_CONFIG", path.as_str())])).unwrap();
        assert_eq!(config.ear_threshold, 0.2);
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "similarity = 0.6").unwrap();

        assert!(Config::load_from(Some(file.path()), env_of(&[])).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::load_from(Some(Path::new("/nonexistent/attendance.toml")), env_of(&[]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("reading config file"));
    }

    #[test]
    fn test_invalid_env_override_is_ignored() {
        let env = env_of(&[
            ("ATTENDANCE_SIMILARITY_THRESHOLD", "high"),
            ("ATTENDANCE_MATCH_POLICY", "random"),
        ]);
        let config = Config::load_from(None, env).unwrap();
        assert_eq!(config.similarity_threshold, 0.5);
        assert_eq!(config.match_policy, MatchPolicy::First);
    }

    #[test]
    fn test_out_of_range_threshold_is_rejected() {
        let env = env_of(&[("ATTENDANCE_SIMILARITY_THRESHOLD", "1.5")]);
        assert!(Config::load_from(None, env).is_err());

        let env = env_of(&[("ATTENDANCE_EAR_THRESHOLD", "0")]);
        assert!(Config::load_from(None, env).is_err());

        let env = env_of(&[("ATTENDANCE_POOL_SIZE", "0")]);
        assert!(Config::load_from(None, env).is_err());
    }

    #[test]
    fn test_blink_config() {
        let env = env_of(&[("ATTENDANCE_EAR_DISTANCE", "euclidean")]);
        let blink = Config::load_from(None, env).unwrap().blink();
        assert_eq!(blink.distance, EarDistance::Euclidean);
        assert_eq!(blink.ear_threshold, 0.25);
    }
}
