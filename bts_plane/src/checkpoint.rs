use std::{
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{
    ml::{
        param::{load_state_dict, state_dict, Parameter, StateDict},
        tacotron::TacotronConfig,
        NodeValue,
    },
    Error, Result,
};

const SNAPSHOT_FORMAT: &str = "snapshot";
const WEIGHTS_FORMAT: &str = "weights";
const FORMAT_VERSION: u32 = 1;

pub mod paths {
    use std::path::{Path, PathBuf};

    pub fn snapshot(outdir: &Path, epoch: usize) -> PathBuf {
        outdir.join(format!("snapshot.ep.{epoch}"))
    }

    pub fn model(outdir: &Path, epoch: usize) -> PathBuf {
        outdir.join(format!("model.ep.{epoch}"))
    }

    pub fn best_model(outdir: &Path) -> PathBuf {
        outdir.join("model.loss.best")
    }

    pub fn run_config(outdir: &Path) -> PathBuf {
        outdir.join("model.conf")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "_format")]
    format: String,
    #[serde(rename = "_version")]
    version: u32,
    payload: T,
}

/// Writes `bytes` next to `path` first and renames into place, so readers
/// never observe a half-written file.
pub fn write_atomic<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|x| x.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn write_envelope<T: Serialize, P: AsRef<Path>>(path: P, format: &str, payload: &T) -> Result<()> {
    let envelope = Envelope {
        format: format.to_string(),
        version: FORMAT_VERSION,
        payload,
    };
    let json = serde_json::to_vec(&envelope)?;
    write_atomic(path, &json)
}

fn read_envelope<T: DeserializeOwned>(path: &Path, format: &str) -> Result<T> {
    let corrupt = |reason: String| Error::corrupt_snapshot(path, reason);

    let file = File::open(path).map_err(|e| corrupt(format!("unreadable: {e}")))?;
    let envelope: Envelope<Value> = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| corrupt(format!("not a valid {format} file: {e}")))?;

    if envelope.format != format {
        return Err(corrupt(format!(
            "expected a {format} file, found '{}'",
            envelope.format
        )));
    }
    if envelope.version != FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported version {} (expected {FORMAT_VERSION})",
            envelope.version
        )));
    }
    serde_json::from_value(envelope.payload).map_err(|e| corrupt(format!("bad payload: {e}")))
}

/// Persists a full training snapshot. `state` carries whatever the caller needs to resume.
pub fn save_snapshot<T: Serialize, P: AsRef<Path>>(path: P, state: &T) -> Result<()> {
    info!("Writing snapshot to path: {}", path.as_ref().display());
    write_envelope(path, SNAPSHOT_FORMAT, state)
}

pub fn load_snapshot<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    info!("Loading snapshot from path: {}", path.display());
    read_envelope(path, SNAPSHOT_FORMAT)
}

/// Saves parameter values only. The file has no device affinity.
pub fn save_weights<P: AsRef<Path>>(path: P, params: &[Parameter]) -> Result<()> {
    write_envelope(path, WEIGHTS_FORMAT, &state_dict(params))
}

pub fn load_weights<P: AsRef<Path>>(path: P, params: &mut [Parameter]) -> Result<()> {
    let path = path.as_ref();
    info!("Loading model weights from path: {}", path.display());
    let dict: StateDict = read_envelope(path, WEIGHTS_FORMAT)?;
    load_state_dict(params, &dict).map_err(|e| Error::corrupt_snapshot(path, e))
}

/// Dimensions, model hyperparameters and the full argument set of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub idim: usize,
    pub odim: usize,
    pub model: TacotronConfig,
    pub args: Value,
}

impl RunConfig {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!("writing a model config file to {}", path.display());
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("reading a model config file from {}", path.display());
        let file = File::open(path).map_err(|e| Error::corrupt_snapshot(path, e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| Error::corrupt_snapshot(path, e))
    }
}

/// Tracks the lowest validation loss seen so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BestModelTracker {
    best: Option<NodeValue>,
}

impl BestModelTracker {
    pub fn best(&self) -> Option<NodeValue> {
        self.best
    }

    /// Strictly lower than every loss seen so far. NaN never improves.
    pub fn improves(&self, loss: NodeValue) -> bool {
        match self.best {
            _ if loss.is_nan() => false,
            Some(best) => loss < best,
            None => true,
        }
    }

    /// Overwrites the best-model file when `loss` improves. Returns whether it did.
    pub fn save_if_improved(
        &mut self,
        outdir: &Path,
        loss: NodeValue,
        params: &[Parameter],
    ) -> Result<bool> {
        if !self.improves(loss) {
            return Ok(false);
        }
        let path: PathBuf = paths::best_model(outdir);
        info!("validation loss improved to {loss:.6}, saving {}", path.display());
        save_weights(&path, params)?;
        self.best = Some(loss);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::ml::linear::Linear;

    use super::*;

    fn params(seed: NodeValue) -> Vec<Parameter> {
        vec![
            Parameter::new(
                "a",
                Linear::from_iter(2, (0..4).map(|x| seed + x as NodeValue / 3.0)).unwrap(),
            ),
            Parameter::new("b", Linear::with_value(1, 3, seed * 0.1)),
        ]
    }

    #[test]
    fn weights_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = paths::model(dir.path(), 3);
        save_weights(&path, &params(1.7)).unwrap();

        let mut restored = params(0.0);
        load_weights(&path, &mut restored).unwrap();
        assert_eq!(restored, params(1.7));
    }

    #[test]
    fn snapshot_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = paths::snapshot(dir.path(), 1);
        let state = BTreeMap::from([("epoch".to_string(), 1), ("iteration".to_string(), 42)]);
        save_snapshot(&path, &state).unwrap();

        let restored: BTreeMap<String, i32> = load_snapshot(&path).unwrap();
        assert_eq!(restored, state);
        assert!(!dir.path().join(".snapshot.ep.1.tmp").exists());
    }

    #[test]
    fn truncated_snapshot_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = paths::snapshot(dir.path(), 1);
        std::fs::write(&path, br#"{"_format": "snapshot", "_vers"#).unwrap();

        let err = load_snapshot::<Value, _>(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot { .. }));
    }

    #[test]
    fn weights_file_is_not_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = paths::model(dir.path(), 1);
        save_weights(&path, &params(1.0)).unwrap();

        let err = load_snapshot::<Value, _>(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot { .. }));
    }

    #[test]
    fn missing_snapshot_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_snapshot::<Value, _>(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot { .. }));
    }

    #[test]
    fn mismatched_weights_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w");
        save_weights(&path, &params(1.0)[..1]).unwrap();

        let mut target = params(0.0);
        assert!(load_weights(&path, &mut target).is_err());
    }

    #[test_log::test]
    fn run_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            idim: 40,
            odim: 80,
            model: TacotronConfig::new(40, 80),
            args: serde_json::json!({"lr": 0.001, "batch_size": 32}),
        };
        config.save(paths::run_config(dir.path())).unwrap();
        assert_eq!(RunConfig::load(paths::run_config(dir.path())).unwrap(), config);
    }

    #[test_log::test]
    fn best_model_only_saved_on_strict_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let path = paths::best_model(dir.path());
        let mut tracker = BestModelTracker::default();

        assert!(tracker.save_if_improved(dir.path(), 2.0, &params(1.0)).unwrap());
        assert!(!tracker.save_if_improved(dir.path(), 2.0, &params(2.0)).unwrap());
        assert!(!tracker.save_if_improved(dir.path(), NodeValue::NAN, &params(2.0)).unwrap());

        let mut saved = params(0.0);
        load_weights(&path, &mut saved).unwrap();
        assert_eq!(saved, params(1.0));

        assert!(tracker.save_if_improved(dir.path(), 1.5, &params(3.0)).unwrap());
        load_weights(&path, &mut saved).unwrap();
        assert_eq!(saved, params(3.0));
        assert_eq!(tracker.best(), Some(1.5));
    }
}
