//! Worker launch descriptors and per-stage command lines.
//!
//! The caller resolves *where* the interpreter and worker scripts live; this
//! module turns that descriptor plus a stage's parameters into a concrete
//! [`LaunchSpec`] (argv vector, working directory, environment).

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Separator for `PATH`-style variables on this platform.
pub const PATH_DELIMITER: &str = if cfg!(windows) { ";" } else { ":" };

/// The worker scripts the orchestrator knows how to launch.
///
/// Collection, training and prediction are pipeline stages;
/// `DependencyCheck` is a standalone diagnostic with no handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Collection,
    Training,
    Prediction,
    #[serde(rename = "dependency-check")]
    DependencyCheck,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Collection,
        StageKind::Training,
        StageKind::Prediction,
        StageKind::DependencyCheck,
    ];

    /// File name of the worker script that implements this stage.
    pub fn script_name(self) -> &'static str {
        match self {
            StageKind::Collection => "collect_random_data.py",
            StageKind::Training => "train_model.py",
            StageKind::Prediction => "prediction.py",
            StageKind::DependencyCheck => "check_depends.py",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageKind::Collection => "collection",
            StageKind::Training => "training",
            StageKind::Prediction => "prediction",
            StageKind::DependencyCheck => "dependency-check",
        };
        f.write_str(s)
    }
}

/// A resolved worker runtime: interpreter, module search path, script
/// directory and extra environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLaunchDescriptor {
    pub executable: PathBuf,
    /// Prepended to the inherited `PATH`.
    pub search_path: Vec<PathBuf>,
    /// Directory holding the worker scripts; also the worker's cwd.
    pub working_directory: PathBuf,
    /// Overrides applied last, after the stage defaults.
    pub environment: BTreeMap<String, String>,
}

impl WorkerLaunchDescriptor {
    pub fn new(executable: impl Into<PathBuf>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            search_path: Vec::new(),
            working_directory: working_directory.into(),
            environment: BTreeMap::new(),
        }
    }

    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn script_path(&self, stage: StageKind) -> PathBuf {
        self.working_directory.join(stage.script_name())
    }
}

/// Serial device the collection worker reads from, per platform.
pub fn default_tty() -> &'static str {
    if cfg!(target_os = "macos") {
        "/dev/cu.usbmodem1421"
    } else if cfg!(windows) {
        "COM4"
    } else {
        "/dev/ttyACM0"
    }
}

/// Inputs of the collection worker.
#[derive(Clone, PartialEq, Eq)]
pub struct CollectionArgs {
    pub host: String,
    pub user: String,
    pub password: String,
    /// Passed verbatim, even when empty.
    pub su_password: String,
    pub data_dir: PathBuf,
    pub min_duty: u32,
    pub max_duty: u32,
    pub samples: u32,
    pub tty: String,
}

impl fmt::Debug for CollectionArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionArgs")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("su_password", &"<redacted>")
            .field("data_dir", &self.data_dir)
            .field("min_duty", &self.min_duty)
            .field("max_duty", &self.max_duty)
            .field("samples", &self.samples)
            .field("tty", &self.tty)
            .finish()
    }
}

/// Inputs of the training worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingArgs {
    pub sample_directory: String,
}

/// Inputs of the prediction worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionArgs {
    pub model_id: String,
    pub sample_id: String,
    pub operator_id: String,
    pub data_dir: PathBuf,
}

/// Stage inputs, one variant per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageParams {
    Collection(CollectionArgs),
    Training(TrainingArgs),
    Prediction(PredictionArgs),
    /// Import-checks the worker runtime's modules; takes no arguments.
    DependencyCheck,
}

impl StageParams {
    pub fn kind(&self) -> StageKind {
        match self {
            StageParams::Collection(_) => StageKind::Collection,
            StageParams::Training(_) => StageKind::Training,
            StageParams::Prediction(_) => StageKind::Prediction,
            StageParams::DependencyCheck => StageKind::DependencyCheck,
        }
    }

    /// Worker arguments following the script path.
    pub fn arguments(&self) -> Vec<String> {
        match self {
            StageParams::Collection(a) => vec![
                a.host.clone(),
                a.password.clone(),
                a.su_password.clone(),
                "-d".to_owned(),
                path_arg(&a.data_dir),
                "-u".to_owned(),
                a.user.clone(),
                "--min".to_owned(),
                a.min_duty.to_string(),
                "--max".to_owned(),
                a.max_duty.to_string(),
                "-s".to_owned(),
                a.samples.to_string(),
                "-t".to_owned(),
                a.tty.clone(),
            ],
            StageParams::Training(a) => vec!["-d".to_owned(), a.sample_directory.clone()],
            StageParams::Prediction(a) => vec![
                a.model_id.clone(),
                a.sample_id.clone(),
                a.operator_id.clone(),
                "-d".to_owned(),
                path_arg(&a.data_dir),
            ],
            StageParams::DependencyCheck => Vec::new(),
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// A fully built worker command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
    /// Set on top of the inherited environment.
    pub environment: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Build the command for `params` using the inherited `PATH`.
    pub fn build(descriptor: &WorkerLaunchDescriptor, params: &StageParams) -> Self {
        Self::build_with_path(descriptor, params, std::env::var_os("PATH"))
    }

    /// Build the command for `params` on top of an explicit inherited `PATH`.
    pub fn build_with_path(
        descriptor: &WorkerLaunchDescriptor,
        params: &StageParams,
        inherited_path: Option<OsString>,
    ) -> Self {
        let stage = params.kind();

        let mut arguments = vec![path_arg(&descriptor.script_path(stage))];
        arguments.extend(params.arguments());

        let mut environment = BTreeMap::new();
        environment.insert(
            "PATH".to_owned(),
            prepend_search_path(&descriptor.search_path, inherited_path),
        );
        environment.insert("PYTHONIOENCODING".to_owned(), "utf-8".to_owned());
        if stage == StageKind::Prediction {
            environment.insert("QT_QPA_PLATFORM".to_owned(), "offscreen".to_owned());
        }
        environment.extend(descriptor.environment.clone());

        Self {
            executable: descriptor.executable.clone(),
            arguments,
            working_directory: descriptor.working_directory.clone(),
            environment,
        }
    }
}

fn prepend_search_path(search_path: &[PathBuf], inherited: Option<OsString>) -> String {
    let mut parts: Vec<String> = search_path.iter().map(|p| path_arg(p)).collect();
    if let Some(inherited) = inherited {
        let inherited = inherited.to_string_lossy().into_owned();
        if !inherited.is_empty() {
            parts.push(inherited);
        }
    }
    parts.join(PATH_DELIMITER)
}
