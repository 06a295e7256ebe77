//! Runtime Configuration
//! Mission: Centralize environment-driven settings for storage, auth, and AL

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

/// Skin lesion classes (HAM10000), in stable index order.
pub const LABELS: [&str; 7] = ["akiec", "bcc", "bkl", "df", "mel", "nv", "vasc"];

/// First case id handed out by the per-user allocator.
pub const CASE_ID_START: u32 = 10_000;

/// Case ids longer than this are legacy date-based ids and are ignored
/// when reconstructing the allocator from a ledger scan.
pub const CASE_ID_MAX_DIGITS: usize = 6;

/// Map a class label to its training index.
pub fn label_index(label: &str) -> Option<usize> {
    LABELS.iter().position(|l| *l == label)
}

/// Supported model architectures for retraining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    EfficientNetV2M,
    ResNet50,
    MobileNetV3Large,
    Yolo,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::EfficientNetV2M => "efficientnet_v2_m",
            Architecture::ResNet50 => "resnet50",
            Architecture::MobileNetV3Large => "mobilenet_v3_large",
            Architecture::Yolo => "yolo",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "efficientnet_v2_m" => Some(Architecture::EfficientNetV2M),
            "resnet50" => Some(Architecture::ResNet50),
            "mobilenet_v3_large" => Some(Architecture::MobileNetV3Large),
            "yolo" => Some(Architecture::Yolo),
            _ => None,
        }
    }
}

/// All runtime settings, resolved once at startup and shared via `Arc`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    // Case/image storage
    pub storage_root: PathBuf,
    pub metadata_filename: String,
    pub legacy_metadata_file: PathBuf,

    // Quality gate
    pub blur_threshold: f64,

    // Auth
    pub api_key: String,
    pub jwt_secret: String,
    pub jwt_expiration_hours: i64,
    pub users_db_path: PathBuf,
    pub allowed_origins: Vec<String>,

    // Encryption at rest
    pub encrypt_storage: bool,
    pub data_encryption_key: String,

    // Active Learning workspace
    pub al_root: PathBuf,

    // Retraining
    pub retrain_min_new_labels: usize,
    pub retrain_device: String,
    pub force_base_model_only: bool,
    pub default_architecture: String,
    pub base_model_paths: BTreeMap<String, PathBuf>,

    // Experience replay
    pub replay_enabled: bool,
    pub old_dataset_dir: PathBuf,
    pub old_data_csv: PathBuf,
    pub old_data_csv_image_column: String,
    pub old_data_csv_label_column: String,
    pub replay_quota: usize,
    pub replay_herding_ratio: f64,
    pub replay_random_ratio: f64,
    pub replay_seed: u64,

    // Train/val split
    pub split_seed: u64,
    pub split_train_ratio: f64,

    // Candidate selection defaults
    pub candidates_top_k: usize,
    pub candidates_include_labeled: bool,
}

impl Settings {
    /// Build settings from the environment, with the documented defaults.
    pub fn from_env() -> Self {
        let storage_root = PathBuf::from(env_or("STORAGE_ROOT", "storage"));
        let al_root = PathBuf::from(env_or("AL_ROOT", "AL"));
        let mut settings = Self::defaults_at(storage_root, al_root);

        settings.host = env_or("SERVER_HOST", &settings.host);
        settings.port = env_parse("SERVER_PORT", settings.port);
        settings.blur_threshold = env_parse("BLUR_THRESHOLD", settings.blur_threshold);
        settings.api_key = env_or("API_KEY", &settings.api_key);
        settings.jwt_secret = env_or("JWT_SECRET_KEY", &settings.jwt_secret);
        settings.jwt_expiration_hours =
            env_parse("JWT_EXPIRATION_HOURS", settings.jwt_expiration_hours);
        if let Ok(path) = env::var("USERS_DB_PATH") {
            settings.users_db_path = PathBuf::from(path);
        }
        settings.allowed_origins = env_list("ALLOWED_ORIGINS", &settings.allowed_origins);
        settings.encrypt_storage = env_flag("ENCRYPT_STORAGE", settings.encrypt_storage);
        settings.data_encryption_key = env_or("DATA_ENCRYPTION_KEY", "");
        settings.retrain_min_new_labels =
            env_parse("RETRAIN_MIN_NEW_LABELS", settings.retrain_min_new_labels);
        settings.retrain_device = env_or("RETRAIN_DEVICE", &settings.retrain_device);
        settings.force_base_model_only =
            env_flag("AL_FORCE_BASE_MODEL_ONLY", settings.force_base_model_only);
        settings.default_architecture =
            env_or("AL_DEFAULT_ARCHITECTURE", &settings.default_architecture);
        settings.replay_enabled =
            env_flag("AL_EXPERIENCE_REPLAY_ENABLED", settings.replay_enabled);
        if let Ok(path) = env::var("AL_OLD_DATASET_DIR") {
            settings.old_dataset_dir = PathBuf::from(path);
        }
        if let Ok(path) = env::var("AL_OLD_DATA_CSV") {
            settings.old_data_csv = PathBuf::from(path);
        }
        settings.replay_quota = env_parse("AL_REPLAY_OLD_QUOTA", settings.replay_quota);
        settings.replay_herding_ratio =
            env_parse("AL_REPLAY_HERDING_RATIO", settings.replay_herding_ratio);
        settings.replay_random_ratio =
            env_parse("AL_REPLAY_RANDOM_RATIO", settings.replay_random_ratio);
        settings.replay_seed = env_parse("AL_REPLAY_RANDOM_SEED", settings.replay_seed);
        settings.split_seed = env_parse("AL_SPLIT_SEED", settings.split_seed);
        settings.split_train_ratio =
            env_parse("AL_SPLIT_TRAIN_RATIO", settings.split_train_ratio);
        settings.candidates_top_k =
            env_parse("AL_CANDIDATES_TOP_K", settings.candidates_top_k);
        settings.candidates_include_labeled = env_flag(
            "AL_CANDIDATES_INCLUDE_LABELED",
            settings.candidates_include_labeled,
        );

        settings
    }

    /// Default settings rooted at the given storage and AL directories.
    /// Tests build their settings through this with temp directories.
    pub fn defaults_at(storage_root: PathBuf, al_root: PathBuf) -> Self {
        let metadata_filename = "metadata.jsonl".to_string();
        let legacy_metadata_file = storage_root.join(&metadata_filename);
        let users_db_path = storage_root.join("users.db");
        let assets = PathBuf::from("assets");

        let mut base_model_paths = BTreeMap::new();
        base_model_paths.insert(
            Architecture::EfficientNetV2M.as_str().to_string(),
            assets.join("models").join("base_efficientnet_v2_m.pt"),
        );
        base_model_paths.insert(
            Architecture::ResNet50.as_str().to_string(),
            assets.join("models").join("base_resnet50.pt"),
        );
        base_model_paths.insert(
            Architecture::MobileNetV3Large.as_str().to_string(),
            assets.join("models").join("base_mobilenet_v3_large.pt"),
        );
        base_model_paths.insert(
            Architecture::Yolo.as_str().to_string(),
            assets.join("models").join("base_yolo_cls.pt"),
        );

        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            storage_root,
            metadata_filename,
            legacy_metadata_file,
            blur_threshold: 50.0,
            api_key: "abc123".to_string(),
            jwt_secret: "change-me-in-production".to_string(),
            jwt_expiration_hours: 24,
            users_db_path,
            allowed_origins: vec!["*".to_string()],
            encrypt_storage: false,
            data_encryption_key: String::new(),
            al_root,
            retrain_min_new_labels: 20,
            retrain_device: "auto".to_string(),
            force_base_model_only: true,
            default_architecture: Architecture::EfficientNetV2M.as_str().to_string(),
            base_model_paths,
            replay_enabled: true,
            old_dataset_dir: assets.join("old_dataset"),
            old_data_csv: assets.join("old_dataset_manifest.csv"),
            old_data_csv_image_column: "image_id".to_string(),
            old_data_csv_label_column: "dx".to_string(),
            replay_quota: 150,
            replay_herding_ratio: 0.8,
            replay_random_ratio: 0.2,
            replay_seed: 42,
            split_seed: 42,
            split_train_ratio: 0.8,
            candidates_top_k: 5,
            candidates_include_labeled: false,
        }
    }

    // AL workspace layout. Everything under al_root is derived, never configured
    // piecemeal, so a single env var relocates the whole workspace.

    pub fn al_models_dir(&self) -> PathBuf {
        self.al_root.join("models")
    }

    pub fn al_production_dir(&self) -> PathBuf {
        self.al_models_dir().join("production")
    }

    pub fn al_candidates_dir(&self) -> PathBuf {
        self.al_models_dir().join("candidates")
    }

    pub fn al_archive_dir(&self) -> PathBuf {
        self.al_models_dir().join("archive")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.al_root.join("db").join("model_registry.json")
    }

    pub fn labels_pool_file(&self) -> PathBuf {
        self.al_root.join("db").join("labels_pool.jsonl")
    }

    pub fn event_log_file(&self) -> PathBuf {
        self.al_root.join("db").join("event_log.jsonl")
    }

    pub fn active_config_file(&self) -> PathBuf {
        self.al_root.join("config").join("active_config.json")
    }

    pub fn user_storage_dir(&self, user_id: &str) -> PathBuf {
        self.storage_root.join(user_id)
    }

    pub fn user_metadata_path(&self, user_id: &str) -> PathBuf {
        self.user_storage_dir(user_id).join(&self.metadata_filename)
    }

    pub fn user_counter_path(&self, user_id: &str) -> PathBuf {
        self.user_storage_dir(user_id).join("case_counter.json")
    }

    pub fn base_model_path(&self, architecture: &str) -> Option<&Path> {
        self.base_model_paths.get(architecture).map(PathBuf::as_path)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_list(key: &str, default: &[String]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => {
            let items: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if items.is_empty() {
                default.to_vec()
            } else {
                items
            }
        }
        Err(_) => default.to_vec(),
    }
}
